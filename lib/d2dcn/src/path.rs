//! Endpoint UID construction, directory-query regex building and UID parsing.
//!
//! A UID is the full `d2dcn/<mac>/<service>/<mode>/<category>/<name>` path
//! uniquely identifying an endpoint in the directory.

use crate::PATH_PREFIX;

/// Whether an endpoint is a callable command or a published info value.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Mode {
    Command,
    Info,
}

impl Mode {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Command => "command",
            Mode::Info => "info",
        }
    }

    fn from_str(text: &str) -> Option<Mode> {
        match text {
            "command" => Some(Mode::Command),
            "info" => Some(Mode::Info),
            _ => None,
        }
    }
}

/// Structured identity parsed out of a UID path.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Uid {
    pub mac: String,
    pub service: String,
    pub mode: Mode,
    pub category: String,
    pub name: String,
}

impl Uid {
    /// Renders the full directory path of this identity.
    pub fn path(&self) -> String {
        create_uid(&self.mac, &self.service, &self.category, self.mode, &self.name)
    }
}

/// Builds the strict UID path used when publishing. Any `/` embedded in a
/// component is replaced with `-` so the segment count stays fixed.
pub fn create_uid(mac: &str, service: &str, category: &str, mode: Mode, name: &str) -> String {
    let clean = |component: &str| component.replace('/', "-");

    format!(
        "{}/{}/{}/{}/{}/{}",
        PATH_PREFIX,
        clean(mac),
        clean(service),
        mode.as_str(),
        clean(category),
        clean(name)
    )
}

/// Builds the regex used for consumer queries against the directory. Empty
/// components match anything.
pub fn create_regex_path(mac: &str, service: &str, category: &str, mode: Mode, name: &str) -> String {
    let open = |component: &str| {
        if component.is_empty() {
            ".*".to_string()
        } else {
            component.to_string()
        }
    };

    format!(
        "{}/{}/{}/{}/{}/{}",
        PATH_PREFIX,
        open(mac),
        open(service),
        mode.as_str(),
        open(category),
        open(name)
    )
}

/// Splits a UID path into its structured fields. Fails when the prefix is not
/// the expected literal, the mode is unknown or fewer than six segments are
/// present. Extra segments are folded back into the name.
pub fn extract_path_info(path: &str) -> Option<Uid> {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() < 6 || segments[0] != PATH_PREFIX {
        return None;
    }

    Some(Uid {
        mac: segments[1].to_string(),
        service: segments[2].to_string(),
        mode: Mode::from_str(segments[3])?,
        category: segments[4].to_string(),
        name: segments[5..].join("/"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn test_create_uid() {
        let uid = create_uid("1234abcd", "svc", "generic", Mode::Command, "cmd");
        assert_eq!(uid, "d2dcn/1234abcd/svc/command/generic/cmd");
    }

    #[test]
    fn test_create_uid_sanitizes_slashes() {
        let uid = create_uid("12/34", "s/vc", "gen/eric", Mode::Info, "na/me");
        assert_eq!(uid, "d2dcn/12-34/s-vc/info/gen-eric/na-me");
    }

    #[test]
    fn test_extract_path_info() {
        let uid = extract_path_info("d2dcn/1234abcd/svc/command/generic/cmd").unwrap();
        assert_eq!(uid.mac, "1234abcd");
        assert_eq!(uid.service, "svc");
        assert_eq!(uid.mode, Mode::Command);
        assert_eq!(uid.category, "generic");
        assert_eq!(uid.name, "cmd");
    }

    #[test]
    fn test_extract_path_info_extra_segments_fold_into_name() {
        let uid = extract_path_info("d2dcn/m/s/info/cat/a/b/c").unwrap();
        assert_eq!(uid.name, "a/b/c");
    }

    #[test]
    fn test_extract_path_info_rejects() {
        assert!(extract_path_info("other/m/s/command/cat/name").is_none());
        assert!(extract_path_info("d2dcn/m/s/command/cat").is_none());
        assert!(extract_path_info("d2dcn/m/s/bogus/cat/name").is_none());
    }

    #[test]
    fn test_uid_path_roundtrip() {
        let path = "d2dcn/1234abcd/svc/info/gpio/pin7";
        assert_eq!(extract_path_info(path).unwrap().path(), path);
    }

    #[test]
    fn test_regex_path_open_components() {
        let pattern = create_regex_path("", "", "", Mode::Command, "command_example.*");
        let regex = Regex::new(&pattern).unwrap();

        assert!(regex.is_match("d2dcn/m1/svc/command/generic/command_example1"));
        assert!(regex.is_match("d2dcn/m2/other/command/gpio/command_example2"));
        assert!(!regex.is_match("d2dcn/m1/svc/command/generic/other"));
        assert!(!regex.is_match("d2dcn/m1/svc/info/generic/command_example1"));
    }

    #[test]
    fn test_regex_path_fixed_components() {
        let pattern = create_regex_path("m1", "svc", "", Mode::Info, "");
        let regex = Regex::new(&pattern).unwrap();

        assert!(regex.is_match("d2dcn/m1/svc/info/generic/temp"));
        assert!(!regex.is_match("d2dcn/m2/svc/info/generic/temp"));
    }
}
