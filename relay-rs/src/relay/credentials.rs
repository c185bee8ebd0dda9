//! AWS credentials and the shared config/credentials files
//!
//! Static keys come from the environment or from a profile in
//! `~/.aws/credentials` / `~/.aws/config`. Remote sources (container and
//! instance metadata) live in [`super::provider`].

use crate::error::{RelayRsError, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Remaining lifetime below which temporary credentials are fetched again
const REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    /// Set for temporary credentials
    pub expires_at: Option<DateTime<Utc>>,
}

impl AwsCredentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            expires_at: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether these credentials can still be used at `now`
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - Duration::seconds(REFRESH_MARGIN_SECS) > now,
            None => true,
        }
    }

    /// Read `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and `AWS_SESSION_TOKEN`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let access_key_id = non_empty("AWS_ACCESS_KEY_ID")
            .ok_or_else(|| RelayRsError::Credentials("AWS_ACCESS_KEY_ID is not set".to_string()))?;
        let secret_access_key = non_empty("AWS_SECRET_ACCESS_KEY").ok_or_else(|| {
            RelayRsError::Credentials("AWS_SECRET_ACCESS_KEY is not set".to_string())
        })?;

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token: non_empty("AWS_SESSION_TOKEN"),
            expires_at: None,
        })
    }
}

// Keep secrets out of logs
impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("session_token", &self.session_token.as_ref().map(|_| "***"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Locations of the shared files and the selected profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileFiles {
    pub credentials_file: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub profile: String,
    /// `AWS_PROFILE` was set, so a missing profile is an error
    pub explicit: bool,
}

impl ProfileFiles {
    /// `AWS_SHARED_CREDENTIALS_FILE`, `AWS_CONFIG_FILE` and `AWS_PROFILE`,
    /// falling back to `~/.aws/*` and `default`
    pub(crate) fn from_lookup<F>(lookup: F, home: Option<&Path>) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let in_home = |name: &str| home.map(|h| h.join(".aws").join(name));

        let profile = non_empty("AWS_PROFILE");
        Self {
            credentials_file: non_empty("AWS_SHARED_CREDENTIALS_FILE")
                .map(PathBuf::from)
                .or_else(|| in_home("credentials")),
            config_file: non_empty("AWS_CONFIG_FILE")
                .map(PathBuf::from)
                .or_else(|| in_home("config")),
            explicit: profile.is_some(),
            profile: profile.unwrap_or_else(|| "default".to_string()),
        }
    }

    /// Static keys for the selected profile, if either file has them
    ///
    /// The credentials file wins over the config file. Missing files are
    /// skipped.
    pub fn load(&self) -> Result<Option<AwsCredentials>> {
        if let Some(ref path) = self.credentials_file {
            if let Some(section) = read_sections(path)?.remove(&self.profile) {
                return profile_credentials(&self.profile, &section).map(Some);
            }
        }

        if let Some(ref path) = self.config_file {
            let name = if self.profile == "default" {
                "default".to_string()
            } else {
                format!("profile {}", self.profile)
            };
            if let Some(section) = read_sections(path)?.remove(&name) {
                if section.contains_key("aws_access_key_id") {
                    return profile_credentials(&self.profile, &section).map(Some);
                }
            }
        }

        Ok(None)
    }
}

fn read_sections(path: &Path) -> Result<HashMap<String, HashMap<String, String>>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(parse_ini(&content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(RelayRsError::Credentials(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

fn profile_credentials(profile: &str, section: &HashMap<String, String>) -> Result<AwsCredentials> {
    let value = |key: &str| section.get(key).filter(|v| !v.is_empty()).cloned();

    let access_key_id = value("aws_access_key_id").ok_or_else(|| {
        RelayRsError::Credentials(format!("profile '{}' has no aws_access_key_id", profile))
    })?;
    let secret_access_key = value("aws_secret_access_key").ok_or_else(|| {
        RelayRsError::Credentials(format!("profile '{}' has no aws_secret_access_key", profile))
    })?;

    Ok(AwsCredentials {
        access_key_id,
        secret_access_key,
        session_token: value("aws_session_token"),
        expires_at: None,
    })
}

/// Sections of an AWS-style INI file; keys are lowercased, `#`/`;` start comments
fn parse_ini(content: &str) -> HashMap<String, HashMap<String, String>> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
            sections.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }

        if let (Some(section), Some((key, value))) = (current.as_ref(), line.split_once('=')) {
            if let Some(entries) = sections.get_mut(section) {
                entries.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }
    }

    sections
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_credentials_from_lookup() {
        let creds = AwsCredentials::from_lookup(lookup(&[
            ("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE"),
            ("AWS_SECRET_ACCESS_KEY", "secret"),
        ]))
        .unwrap();

        assert_eq!(creds.access_key_id, "AKIDEXAMPLE");
        assert_eq!(creds.secret_access_key, "secret");
        assert!(creds.session_token.is_none());
    }

    #[test]
    fn test_credentials_with_session_token() {
        let creds = AwsCredentials::from_lookup(lookup(&[
            ("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE"),
            ("AWS_SECRET_ACCESS_KEY", "secret"),
            ("AWS_SESSION_TOKEN", "token"),
        ]))
        .unwrap();

        assert_eq!(creds.session_token.as_deref(), Some("token"));
    }

    #[test]
    fn test_missing_secret_is_an_error() {
        let result = AwsCredentials::from_lookup(lookup(&[("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE")]));
        assert!(matches!(result, Err(RelayRsError::Credentials(_))));
    }

    #[test]
    fn test_debug_hides_secret() {
        let creds = AwsCredentials::new("AKIDEXAMPLE", "very-secret").with_session_token("tok");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("AKIDEXAMPLE"));
        assert!(!debug.contains("very-secret"));
        assert!(!debug.contains("tok\""));
    }

    #[test]
    fn test_freshness() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let creds = AwsCredentials::new("AKID", "secret");
        assert!(creds.is_fresh(now));

        let later = creds.clone().with_expiry(now + Duration::hours(1));
        assert!(later.is_fresh(now));

        let soon = creds.with_expiry(now + Duration::seconds(60));
        assert!(!soon.is_fresh(now));
    }

    #[test]
    fn test_parse_ini() {
        let sections = parse_ini(
            "# comment\n[default]\naws_access_key_id = AKID1\nAWS_Secret_Access_Key=s1\n\n[profile   dev]\n; note\nregion = eu-west-1\n",
        );

        assert_eq!(sections["default"]["aws_access_key_id"], "AKID1");
        assert_eq!(sections["default"]["aws_secret_access_key"], "s1");
        assert_eq!(sections["profile dev"]["region"], "eu-west-1");
    }

    #[test]
    fn test_profile_files_default_locations() {
        let files = ProfileFiles::from_lookup(lookup(&[]), Some(Path::new("/home/relay")));

        assert_eq!(files.credentials_file, Some(PathBuf::from("/home/relay/.aws/credentials")));
        assert_eq!(files.config_file, Some(PathBuf::from("/home/relay/.aws/config")));
        assert_eq!(files.profile, "default");
        assert!(!files.explicit);
    }

    #[test]
    fn test_load_named_profile_from_credentials_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[default]\naws_access_key_id = AKIDDEFAULT\naws_secret_access_key = d\n\n[relay]\naws_access_key_id = AKIDRELAY\naws_secret_access_key = r\naws_session_token = t"
        )
        .unwrap();

        let files = ProfileFiles::from_lookup(
            lookup(&[
                ("AWS_SHARED_CREDENTIALS_FILE", file.path().to_str().unwrap()),
                ("AWS_PROFILE", "relay"),
            ]),
            None,
        );
        let creds = files.load().unwrap().unwrap();

        assert_eq!(creds.access_key_id, "AKIDRELAY");
        assert_eq!(creds.secret_access_key, "r");
        assert_eq!(creds.session_token.as_deref(), Some("t"));
    }

    #[test]
    fn test_load_from_config_file_profile_section() {
        let mut config = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            config,
            "[profile ops]\nregion = us-west-2\naws_access_key_id = AKIDOPS\naws_secret_access_key = o"
        )
        .unwrap();

        let files = ProfileFiles {
            credentials_file: Some(PathBuf::from("/nonexistent/credentials")),
            config_file: Some(config.path().to_path_buf()),
            profile: "ops".to_string(),
            explicit: true,
        };

        assert_eq!(files.load().unwrap().unwrap().access_key_id, "AKIDOPS");
    }

    #[test]
    fn test_load_missing_profile() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[default]\naws_access_key_id = AKID\n").unwrap();

        let files = ProfileFiles {
            credentials_file: Some(file.path().to_path_buf()),
            config_file: None,
            profile: "other".to_string(),
            explicit: true,
        };
        assert_eq!(files.load().unwrap(), None);

        // Present but incomplete is an error
        let files = ProfileFiles {
            profile: "default".to_string(),
            ..files
        };
        assert!(matches!(files.load(), Err(RelayRsError::Credentials(_))));
    }
}
