use crate::rbac::Role;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Persisted user record.
///
/// `password_hash` and `pin_hash` are always derived from the same `salt`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(default)]
    pub username: String,
    pub password_hash: String,
    #[serde(alias = "security_pin_hash")]
    pub pin_hash: String,
    pub salt: String,
    pub email: String,
    pub role: Role,
    #[serde(default)]
    pub mfa_enabled: bool,
    #[serde(deserialize_with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "optional_timestamp")]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(default, alias = "files")]
    pub owned_resource_ids: Vec<String>,
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        // Older files carry naive local ISO timestamps, read them as UTC.
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

fn timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
}

fn optional_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}"))),
    }
}

/// What callers may see of a user: everything except secrets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    pub username: String,
    pub email: String,
    pub role: Role,
    pub mfa_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub owned_resource_ids: Vec<String>,
}

impl From<&UserRecord> for UserProfile {
    fn from(record: &UserRecord) -> Self {
        Self {
            username: record.username.clone(),
            email: record.email.clone(),
            role: record.role,
            mfa_enabled: record.mfa_enabled,
            created_at: record.created_at,
            last_login: record.last_login,
            owned_resource_ids: record.owned_resource_ids.clone(),
        }
    }
}

/// Input for creating a user.
#[derive(Clone, Debug)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password: secrecy::SecretString,
    pub pin: secrecy::SecretString,
    pub role: Role,
    pub mfa_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_field_names_are_accepted() -> anyhow::Result<()> {
        let raw = r#"{
            "password_hash": "aa",
            "salt": "bb",
            "security_pin_hash": "cc",
            "email": "nael@example.com",
            "role": "admin",
            "mfa_enabled": true,
            "created_at": "2024-03-01T09:15:00.123456",
            "last_login": null,
            "files": ["document1.txt", "project.py"]
        }"#;
        let record: UserRecord = serde_json::from_str(raw)?;
        assert_eq!(record.pin_hash, "cc");
        assert_eq!(record.role, Role::Admin);
        assert_eq!(record.owned_resource_ids, vec!["document1.txt", "project.py"]);
        assert_eq!(record.created_at.to_rfc3339(), "2024-03-01T09:15:00.123456+00:00");
        Ok(())
    }

    #[test]
    fn current_field_names_are_written() -> anyhow::Result<()> {
        let record = UserRecord {
            username: "alice".to_string(),
            password_hash: "aa".to_string(),
            pin_hash: "cc".to_string(),
            salt: "bb".to_string(),
            email: "alice@example.com".to_string(),
            role: Role::User,
            mfa_enabled: false,
            created_at: Utc::now(),
            last_login: None,
            owned_resource_ids: Vec::new(),
        };
        let json = serde_json::to_value(&record)?;
        assert!(json.get("pin_hash").is_some());
        assert!(json.get("owned_resource_ids").is_some());
        let mut fields: Vec<&String> = json.as_object().map(|o| o.keys().collect()).unwrap_or_default();
        fields.sort();
        assert_eq!(
            fields,
            [
                "created_at",
                "email",
                "last_login",
                "mfa_enabled",
                "owned_resource_ids",
                "password_hash",
                "pin_hash",
                "role",
                "salt",
                "username"
            ]
        );
        assert_eq!(serde_json::from_value::<UserRecord>(json)?, record);
        Ok(())
    }

    #[test]
    fn profile_hides_secrets() -> anyhow::Result<()> {
        let record: UserRecord = serde_json::from_str(
            r#"{"password_hash":"aa","salt":"bb","pin_hash":"cc","email":"e","role":"guest",
                "created_at":"2024-01-01T00:00:00Z"}"#,
        )?;
        let profile = serde_json::to_value(UserProfile::from(&record))?;
        assert!(profile.get("password_hash").is_none());
        assert!(profile.get("salt").is_none());
        Ok(())
    }
}
