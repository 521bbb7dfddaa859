use fluent_bundle::{FluentArgs, FluentBundle, FluentResource, FluentValue};
use unic_langid::LanguageIdentifier;

const EN_GB: &str = include_str!("../i18n/en-GB.ftl");

/// Fluent localizer over the built-in message resources.
pub struct FluentLoc {
    bundle: FluentBundle<FluentResource>,
}

impl FluentLoc {
    /// Only `en-GB` ships today; other tags fall back to it.
    pub fn builtin(lang: &str) -> Self {
        let langid: LanguageIdentifier =
            lang.parse().or_else(|_| "en-GB".parse()).unwrap_or_default();
        let mut bundle = FluentBundle::new(vec![langid]);
        // Output goes to terminals and scripts; no bidi isolation marks.
        bundle.set_use_isolating(false);
        match FluentResource::try_new(EN_GB.to_owned()) {
            Ok(res) => {
                if let Err(errs) = bundle.add_resource(res) {
                    log::warn!("duplicate messages in en-GB resource: {errs:?}");
                }
            }
            Err((_, errs)) => log::warn!("en-GB resource failed to parse: {errs:?}"),
        }
        Self { bundle }
    }

    /// Format a message by code with named args. Returns the code itself
    /// when the message is unknown or fails to format.
    pub fn msg(&self, code: &str, args: &[(&str, &str)]) -> String {
        let Some(pattern) = self.bundle.get_message(code).and_then(|m| m.value()) else {
            return code.to_string();
        };
        let mut fa = FluentArgs::new();
        for (k, v) in args {
            fa.set(*k, FluentValue::from(*v));
        }
        let mut errs = vec![];
        let s = self.bundle.format_pattern(pattern, Some(&fa), &mut errs).to_string();
        if errs.is_empty() {
            s
        } else {
            code.to_string()
        }
    }
}

impl Default for FluentLoc {
    fn default() -> Self {
        Self::builtin("en-GB")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_known_messages() {
        let loc = FluentLoc::default();
        assert_eq!(loc.msg("verify-ok", &[]), "OK");
        assert_eq!(loc.msg("verify-missing", &[("name", "abc")]), "MISSING abc");
        assert_eq!(
            loc.msg("verify-summary", &[("total", "3"), ("passed", "2"), ("failed", "1")]),
            "Verified 3 files: 2 passed, 1 failed"
        );
    }

    #[test]
    fn unknown_code_and_missing_args_fall_back() {
        let loc = FluentLoc::builtin("fr-FR");
        assert_eq!(loc.msg("no-such-message", &[]), "no-such-message");
        assert_eq!(loc.msg("verify-missing", &[]), "verify-missing");
    }
}
