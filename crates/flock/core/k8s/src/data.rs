use std::{borrow::Borrow, fmt, ops, str::FromStr};

use anyhow::{bail, Error};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use strum::{Display, EnumString};

#[derive(
    Copy, Clone, Debug, Display, EnumString, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub enum ImagePullPolicy {
    Always,
    IfNotPresent,
    Never,
}

/// A DNS-1035 label, the only shape Knative accepts for service names.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct Name(String);

impl Name {
    pub const MAX_LEN: usize = 63;
}

impl FromStr for Name {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, <Self as FromStr>::Err> {
        if name.len() > Self::MAX_LEN {
            bail!(
                "name is too long ({len} > {max}): {name:?}",
                len = name.len(),
                max = Self::MAX_LEN,
            )
        }

        let re = Regex::new(r"^[a-z]([-a-z0-9]*[a-z0-9])?$")?;
        if re.is_match(name) {
            Ok(Self(name.into()))
        } else {
            bail!("invalid name: {name:?}")
        }
    }
}

impl From<Name> for String {
    fn from(value: Name) -> Self {
        value.0
    }
}

impl Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl ops::Deref for Name {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <String as fmt::Debug>::fmt(&self.0, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <String as fmt::Display>::fmt(&self.0, f)
    }
}

impl PartialEq<str> for Name {
    fn eq(&self, other: &str) -> bool {
        self.0.eq(other)
    }
}

impl<'de> Deserialize<'de> for Name {
    fn deserialize<D>(deserializer: D) -> Result<Self, <D as Deserializer<'de>>::Error>
    where
        D: Deserializer<'de>,
    {
        <String as Deserialize<'de>>::deserialize(deserializer)
            .and_then(|name| Self::from_str(&name).map_err(::serde::de::Error::custom))
    }
}
