/// Detected device capabilities, built from `ADD-DEVICE`'s capability
/// tokens (`spec.md` §4.5). The adapter starts from [`Capabilities::default`]
/// and overlays whatever the device actually reports; unknown tokens are
/// ignored rather than rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub api_version: Option<String>,
    pub variables: bool,
    pub rotation: bool,
    pub variable_write: bool,
    pub key_images: bool,
}

impl Capabilities {
    /// Overlay the tokens from one `ADD-DEVICE` line onto the current set.
    /// Capabilities are additive: a token absent from this call does not
    /// clear one already detected.
    pub fn apply_tokens(&mut self, tokens: &[String]) {
        for token in tokens {
            if let Some(version) = token.strip_prefix("API:") {
                self.api_version = Some(version.to_owned());
                continue;
            }
            match token.as_str() {
                "VARIABLES" => self.variables = true,
                "ROTATION" => self.rotation = true,
                "VARIABLE_WRITE" => self.variable_write = true,
                "KEY_IMAGES" => self.key_images = true,
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tokens_are_ignored() {
        let mut caps = Capabilities::default();
        caps.apply_tokens(&["MYSTERY_TOKEN".to_owned(), "ROTATION".to_owned()]);
        assert!(caps.rotation);
    }

    #[test]
    fn api_version_token_is_captured() {
        let mut caps = Capabilities::default();
        caps.apply_tokens(&["API:1.2".to_owned()]);
        assert_eq!(caps.api_version.as_deref(), Some("1.2"));
    }

    #[test]
    fn overlay_is_additive_across_calls() {
        let mut caps = Capabilities::default();
        caps.apply_tokens(&["VARIABLES".to_owned()]);
        caps.apply_tokens(&["ROTATION".to_owned()]);
        assert!(caps.variables);
        assert!(caps.rotation);
    }
}
