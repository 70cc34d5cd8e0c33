use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(CircleId);
id_newtype!(UserId);
id_newtype!(ServerMessageId);

/// A topic-scoped chat room as published by the discovery service.
///
/// Only `member_count` and `online_count` ever change, and only from server
/// refreshes (or optimistic presence estimates on the client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circle {
    pub id: CircleId,
    pub name: String,
    #[serde(alias = "interest")]
    pub interest_tag: String,
    #[serde(default)]
    pub member_count: u32,
    pub max_members: u32,
    #[serde(default)]
    pub online_count: u32,
    #[serde(default, alias = "is_anonymous")]
    pub allows_anonymous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Circle {
    pub fn is_full(&self) -> bool {
        self.member_count >= self.max_members
    }

    pub fn matches_interest(&self, interest: Option<&str>) -> bool {
        match interest {
            None => true,
            Some(tag) if tag.eq_ignore_ascii_case("all") => true,
            Some(tag) => self.interest_tag.eq_ignore_ascii_case(tag),
        }
    }
}
