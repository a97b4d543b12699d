use std::env;

use crate::engine::BackendKind;
use crate::options::Options;

/// Names the backend kinds whose instances flush their data before first use.
///
/// Holds a comma-separated list of kinds (`memory,redis`) or `*` for all. Used
/// to isolate test runs that share a store.
pub const FLUSH_ENV: &str = "DYNAMIS_FLUSH";

/// Applies environment toggles to the options of an instance of `kind`.
///
/// When [`FLUSH_ENV`] names `kind`, a `flush` pre-hook is registered unless
/// the options already configure one.
///
/// ```no_run
/// use dynamis::sdk::apply_env;
/// use dynamis::Options;
///
/// std::env::set_var("DYNAMIS_FLUSH", "memory");
/// let mut options = Options::default();
/// apply_env("memory", &mut options);
/// assert!(options.before.contains_key("flush"));
/// ```
pub fn apply_env(kind: &str, options: &mut Options) {
    let toggle = env::var(FLUSH_ENV).ok();
    apply_flush_toggle(toggle.as_deref(), kind, options);
}

fn apply_flush_toggle(toggle: Option<&str>, kind: &str, options: &mut Options) {
    let Some(toggle) = toggle else {
        return;
    };
    let wanted = kind.parse::<BackendKind>().ok();
    let selected = toggle.split(',').map(str::trim).any(|entry| {
        entry == "*" || entry == kind || (wanted.is_some() && entry.parse::<BackendKind>().ok() == wanted)
    });

    if selected && !options.before.contains_key("flush") {
        log::debug!("{} requests a flush before first use of {}", FLUSH_ENV, kind);
        options.before.insert("flush".to_string(), Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_toggle_absent() {
        let mut options = Options::default();
        apply_flush_toggle(None, "memory", &mut options);
        assert!(options.before.is_empty());
    }

    #[test]
    fn test_toggle_selects_kind() {
        let mut options = Options::default();
        apply_flush_toggle(Some("redis, memory"), "memory", &mut options);
        assert_eq!(options.before.get("flush"), Some(&vec![]));

        let mut options = Options::default();
        apply_flush_toggle(Some("redis"), "memory", &mut options);
        assert!(options.before.is_empty());
    }

    #[test]
    fn test_toggle_matches_aliases_and_wildcard() {
        let mut options = Options::default();
        apply_flush_toggle(Some("couchdb"), "cradle", &mut options);
        assert!(options.before.contains_key("flush"));

        let mut options = Options::default();
        apply_flush_toggle(Some("*"), "levelup", &mut options);
        assert!(options.before.contains_key("flush"));
    }

    #[test]
    fn test_toggle_keeps_configured_flush() {
        let mut options = Options::new().before("flush", vec![json!("custom")]);
        apply_flush_toggle(Some("*"), "memory", &mut options);
        assert_eq!(options.before.get("flush"), Some(&vec![json!("custom")]));
    }
}
