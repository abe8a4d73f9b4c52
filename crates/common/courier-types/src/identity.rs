use crate::error::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

id_newtype!(
    /// The originator of delivery jobs (a shop).
    MerchantId
);
id_newtype!(
    /// A mobile agent that carries out deliveries.
    CourierId
);
id_newtype!(
    /// The receiving party of a delivery.
    CustomerId
);

/// Identity of a caller or live session.
///
/// Each variant carries only the identifier relevant to that role, so code
/// that needs role-specific behaviour matches on the variant instead of
/// comparing role strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", content = "id", rename_all = "snake_case")]
pub enum Participant {
    Merchant(MerchantId),
    Courier(CourierId),
    Customer(CustomerId),
}

impl Participant {
    /// The addressable channel this participant listens on.
    pub fn channel(&self) -> ChannelId {
        match self {
            Participant::Merchant(id) => ChannelId::merchant(*id),
            Participant::Courier(id) => ChannelId::courier(*id),
            Participant::Customer(id) => ChannelId::customer(*id),
        }
    }

    pub fn as_courier(&self) -> Option<CourierId> {
        match self {
            Participant::Courier(id) => Some(*id),
            Participant::Merchant(_) | Participant::Customer(_) => None,
        }
    }

    pub fn as_merchant(&self) -> Option<MerchantId> {
        match self {
            Participant::Merchant(id) => Some(*id),
            Participant::Courier(_) | Participant::Customer(_) => None,
        }
    }

    pub fn as_customer(&self) -> Option<CustomerId> {
        match self {
            Participant::Customer(id) => Some(*id),
            Participant::Merchant(_) | Participant::Courier(_) => None,
        }
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Participant::Merchant(id) => write!(f, "merchant:{}", id),
            Participant::Courier(id) => write!(f, "courier:{}", id),
            Participant::Customer(id) => write!(f, "customer:{}", id),
        }
    }
}

impl FromStr for Participant {
    type Err = ParseError;

    /// Parses the `<role>:<uuid>` form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (role, id) = s
            .split_once(':')
            .ok_or_else(|| ParseError::MalformedParticipant(s.to_string()))?;
        match role {
            "merchant" => Ok(Participant::Merchant(id.parse()?)),
            "courier" => Ok(Participant::Courier(id.parse()?)),
            "customer" => Ok(Participant::Customer(id.parse()?)),
            other => Err(ParseError::UnknownRole(other.to_string())),
        }
    }
}

/// Name of an addressable push channel, e.g. `courier:<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn merchant(id: MerchantId) -> Self {
        Self(format!("merchant:{}", id))
    }

    pub fn courier(id: CourierId) -> Self {
        Self(format!("courier:{}", id))
    }

    pub fn customer(id: CustomerId) -> Self {
        Self(format!("customer:{}", id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
