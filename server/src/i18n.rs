//! Localized message catalogs.
//!
//! Catalogs are flat TOML files, one per language, in `i18n.dir`:
//!
//! ```toml
//! # locales/en.toml
//! session-end = "session {session_id} ended"
//! closed-by-admin = "closed by admin {closer}"
//! ```
//!
//! Lookup walks the caller's ordered language preferences (a `lang` query
//! parameter first, then `Accept-Language` entries), normalizing regional
//! tags (`en-US` → `en`), then the configured default language, then a
//! compiled-in English fallback. Placeholders use `{name}` substitution.

use std::collections::HashMap;
use std::path::Path;

use tracing::warn;

/// Message key for the farewell sent to monitors when a session ends.
pub const MSG_SESSION_END: &str = "session-end";

/// All loaded languages plus the compiled-in fallback.
pub struct Catalog {
    languages: HashMap<String, HashMap<String, String>>,
    default_lang: String,
}

fn builtin_english() -> HashMap<String, String> {
    [
        (MSG_SESSION_END, "session {session_id} ended"),
        ("closed-by-admin", "closed by admin {closer}"),
        ("invalid-argument", "invalid argument: {detail}"),
        ("invalid-session-id", "invalid session id: {detail}"),
        ("load-session", "failed to load session: {detail}"),
        ("connect-server", "failed to connect server: {detail}"),
        ("no-perm", "permission denied: {detail}"),
        ("bad-request", "bad request: {detail}"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Strip a regional suffix: `zh-CN` → `zh`.
fn normalize(tag: &str) -> &str {
    tag.split(['-', '_', ';']).next().unwrap_or(tag).trim()
}

impl Catalog {
    /// Load every `<lang>.toml` under `dir`. A missing or empty directory is
    /// not an error: the compiled-in English messages still apply.
    pub fn load(dir: &str, default_lang: &str) -> Self {
        let mut languages: HashMap<String, HashMap<String, String>> = HashMap::new();
        languages.insert("en".to_string(), builtin_english());

        if let Ok(entries) = std::fs::read_dir(Path::new(dir)) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                    continue;
                }
                let Some(lang) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                match std::fs::read_to_string(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|s| {
                        toml::from_str::<HashMap<String, String>>(&s).map_err(|e| e.to_string())
                    }) {
                    Ok(messages) => {
                        languages
                            .entry(lang.to_string())
                            .or_default()
                            .extend(messages);
                    }
                    Err(e) => warn!(lang, "skipping unreadable catalog: {e}"),
                }
            }
        }

        Self {
            languages,
            default_lang: default_lang.to_string(),
        }
    }

    /// Catalog with only the compiled-in messages (tests, missing bundle dir).
    pub fn builtin(default_lang: &str) -> Self {
        let mut languages = HashMap::new();
        languages.insert("en".to_string(), builtin_english());
        Self {
            languages,
            default_lang: default_lang.to_string(),
        }
    }

    pub fn default_lang(&self) -> &str {
        &self.default_lang
    }

    /// Resolve `key` against the preference list, substituting `{name}`
    /// placeholders from `args`. Unknown keys come back as the key itself so
    /// a catalog gap never swallows a farewell.
    pub fn localize(&self, prefs: &[&str], key: &str, args: &[(&str, &str)]) -> String {
        let template = prefs
            .iter()
            .map(|p| normalize(p))
            .filter(|p| !p.is_empty())
            .chain([self.default_lang.as_str(), "en"])
            .find_map(|lang| self.languages.get(lang).and_then(|m| m.get(key)));

        let mut out = template.cloned().unwrap_or_else(|| key.to_string());
        for (name, value) in args {
            out = out.replace(&format!("{{{name}}}"), value);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_session_end_substitutes_id() {
        let catalog = Catalog::builtin("en");
        let msg = catalog.localize(&[], MSG_SESSION_END, &[("session_id", "s-42")]);
        assert_eq!(msg, "session s-42 ended");
    }

    #[test]
    fn regional_tags_normalize() {
        let catalog = Catalog::builtin("en");
        let msg = catalog.localize(&["en-US"], "no-perm", &[("detail", "monitor")]);
        assert_eq!(msg, "permission denied: monitor");
    }

    #[test]
    fn unknown_language_falls_back_to_default() {
        let catalog = Catalog::builtin("en");
        let msg = catalog.localize(&["xx"], "bad-request", &[("detail", "nope")]);
        assert_eq!(msg, "bad request: nope");
    }

    #[test]
    fn unknown_key_returns_key() {
        let catalog = Catalog::builtin("en");
        assert_eq!(catalog.localize(&["en"], "no-such-key", &[]), "no-such-key");
    }
}
