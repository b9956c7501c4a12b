//! The user entity served by every worker.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub age: Number,
    pub hobbies: Vec<String>,
}

/// Request body for create and update.
///
/// Fields are kept as raw JSON so that type errors can be reported per
/// field instead of as a generic deserialization failure.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct UserDraft {
    #[serde(default)]
    pub username: Option<Value>,
    #[serde(default)]
    pub age: Option<Value>,
    #[serde(default)]
    pub hobbies: Option<Value>,
}

/// A draft whose present fields all have the right types.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UserChanges {
    pub username: Option<String>,
    pub age: Option<Number>,
    pub hobbies: Option<Vec<String>>,
}

impl UserDraft {
    /// Checks the types of every present field. `null` counts as absent.
    pub fn validate(self) -> Result<UserChanges, StoreError> {
        let username = match self.username {
            None | Some(Value::Null) => None,
            Some(Value::String(name)) => Some(name),
            Some(_) => return Err(StoreError::validation("Username must be a string", "username")),
        };

        let age = match self.age {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => match n.as_f64() {
                Some(age) if age > 0.0 => Some(n),
                _ => return Err(StoreError::validation("Age must be greater than 0", "age")),
            },
            Some(_) => return Err(StoreError::validation("Age must be a number", "age")),
        };

        let hobbies = match self.hobbies {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) => {
                let mut hobbies = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(hobby) => hobbies.push(hobby),
                        _ => {
                            return Err(StoreError::validation(
                                "All hobbies must be strings",
                                "hobbies",
                            ))
                        }
                    }
                }
                Some(hobbies)
            }
            Some(_) => return Err(StoreError::validation("Hobbies must be an array", "hobbies")),
        };

        Ok(UserChanges {
            username,
            age,
            hobbies,
        })
    }
}

impl UserChanges {
    /// Builds a new user with a fresh id. All fields are required.
    pub fn into_user(self) -> Result<User, StoreError> {
        let username = match self.username {
            Some(name) if !name.is_empty() => name,
            _ => return Err(StoreError::validation("Username is required", "username")),
        };
        let age = self
            .age
            .ok_or_else(|| StoreError::validation("Age is required", "age"))?;
        let hobbies = self
            .hobbies
            .ok_or_else(|| StoreError::validation("Hobbies array is required", "hobbies"))?;

        Ok(User {
            id: Uuid::new_v4(),
            username,
            age,
            hobbies,
        })
    }

    /// Overlays the provided fields on an existing user.
    pub fn apply_to(self, existing: &User) -> User {
        User {
            id: existing.id,
            username: self.username.unwrap_or_else(|| existing.username.clone()),
            age: self.age.unwrap_or_else(|| existing.age.clone()),
            hobbies: self.hobbies.unwrap_or_else(|| existing.hobbies.clone()),
        }
    }
}

/// Parses a path id, rejecting anything that is not a UUID.
pub fn parse_id(raw: &str) -> Result<Uuid, StoreError> {
    raw.parse::<Uuid>()
        .map_err(|_| StoreError::validation(format!("Invalid UUID: {raw}"), "id"))
}
