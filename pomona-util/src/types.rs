use std::fmt::{self, Display};
use std::ops::Deref;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0} must not be empty")]
pub struct EmptyValueError(&'static str);

macro_rules! non_empty_string {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl Deref for $name {
            type Target = String;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl TryFrom<String> for $name {
            type Error = EmptyValueError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                let value = value.trim();
                if value.is_empty() {
                    return Err(EmptyValueError($label));
                }
                Ok(Self(value.to_owned()))
            }
        }

        impl FromStr for $name {
            type Err = EmptyValueError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::try_from(s.to_owned())
            }
        }
    };
}

non_empty_string!(
    /// Scope identifying the provisioning service instance the device
    /// enrolls with
    IdScope,
    "id scope"
);

non_empty_string!(
    /// Registration id of the device enrollment. The registry uses the
    /// same value as the device id on the assigned hub
    RegistrationId,
    "registration id"
);

/// Base64 encoded symmetric key of the device enrollment.
///
/// The key is a secret, `Debug` and `Display` never print it. Use
/// [`SymmetricKey::expose`] to get at the raw value when signing.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey(String);

impl SymmetricKey {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

impl Display for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl TryFrom<String> for SymmetricKey {
    type Error = EmptyValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim();
        if value.is_empty() {
            return Err(EmptyValueError("symmetric key"));
        }
        Ok(Self(value.to_owned()))
    }
}

impl FromStr for SymmetricKey {
    type Err = EmptyValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_owned())
    }
}

// Just an alias for more descriptive code
pub type DeviceId = RegistrationId;
