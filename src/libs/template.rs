// Template expansion.
// Registry asset names, download URLs and delegation commands all carry
// `{{.Var}}` placeholders. Rendering is a single dedicated pass: every
// URL and command string goes through `render()`, nothing builds template
// strings by concatenation elsewhere.
//
// Supported forms inside `{{ }}`:
//   .Name                     variable lookup
//   trimV .Name               strip one leading 'v'
//   trimPrefix "p" .Name      strip a prefix (either argument order)
//   trimSuffix "s" .Name      strip a suffix (either argument order)
//
// Unknown variables and unknown functions are errors, not silent blanks.

use crate::libs::errors::EnvboxError;
use std::collections::BTreeMap;

/// The variable set a template is rendered against.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    values: BTreeMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> TemplateVars {
        TemplateVars::default()
    }

    pub fn set(mut self, name: &str, value: impl Into<String>) -> TemplateVars {
        self.values.insert(name.to_string(), value.into());
        self
    }

    /// The standard variable set for a versioned artifact on the current
    /// platform: `Version`, `SemVer` (version with a leading `v` trimmed),
    /// `OS` and `Arch`.
    pub fn for_artifact(version: &str, os: &str, arch: &str) -> TemplateVars {
        TemplateVars::new()
            .set("Version", version)
            .set("SemVer", version.strip_prefix('v').unwrap_or(version))
            .set("OS", os)
            .set("Arch", arch)
    }

    fn lookup(&self, name: &str) -> Result<&str, EnvboxError> {
        self.values
            .get(name)
            .map(|s| s.as_str())
            .ok_or_else(|| EnvboxError::Configuration(format!("unknown template variable '.{name}'")))
    }
}

/// Renders `template`, substituting every `{{...}}` action against `vars`.
pub fn render(template: &str, vars: &TemplateVars) -> Result<String, EnvboxError> {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let end = after_open.find("}}").ok_or_else(|| {
            EnvboxError::Configuration(format!("unterminated template action in '{template}'"))
        })?;
        let action = after_open[..end].trim();
        output.push_str(&eval_action(action, vars)?);
        rest = &after_open[end + 2..];
    }
    output.push_str(rest);
    Ok(output)
}

fn eval_action(action: &str, vars: &TemplateVars) -> Result<String, EnvboxError> {
    if action.is_empty() {
        return Err(EnvboxError::Configuration("empty template action".to_string()));
    }

    // Bare variable reference: `.Version`
    if let Some(name) = action.strip_prefix('.') {
        if !action.contains(char::is_whitespace) {
            return Ok(vars.lookup(name)?.to_string());
        }
    }

    let tokens = tokenize(action)?;
    let (function, args) = tokens
        .split_first()
        .ok_or_else(|| EnvboxError::Configuration("empty template action".to_string()))?;

    match function.as_str() {
        "trimV" => {
            let [Token::Variable(name)] = args else {
                return Err(EnvboxError::Configuration(
                    "trimV takes exactly one variable argument".to_string(),
                ));
            };
            let value = vars.lookup(name)?;
            Ok(value.strip_prefix('v').unwrap_or(value).to_string())
        }
        "trimPrefix" | "trimSuffix" => {
            // One quoted literal and one variable, in either order (both
            // argument conventions appear in registries in the wild).
            let (literal, name) = match args {
                [Token::Literal(l), Token::Variable(v)] => (l, v),
                [Token::Variable(v), Token::Literal(l)] => (l, v),
                _ => {
                    return Err(EnvboxError::Configuration(format!(
                        "{} takes one string literal and one variable",
                        function.as_str()
                    )));
                }
            };
            let value = vars.lookup(name)?;
            let trimmed = if function.as_str() == "trimPrefix" {
                value.strip_prefix(literal.as_str()).unwrap_or(value)
            } else {
                value.strip_suffix(literal.as_str()).unwrap_or(value)
            };
            Ok(trimmed.to_string())
        }
        other => Err(EnvboxError::Configuration(format!(
            "unknown template function '{other}'"
        ))),
    }
}

enum Token {
    Variable(String),
    Literal(String),
}

impl Token {
    fn as_str(&self) -> &str {
        match self {
            Token::Variable(s) | Token::Literal(s) => s,
        }
    }
}

fn tokenize(action: &str) -> Result<Vec<Token>, EnvboxError> {
    let mut tokens = Vec::new();
    let mut chars = action.char_indices().peekable();

    while let Some(&(index, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let start = index + 1;
            let mut end = None;
            for (i, qc) in chars.by_ref() {
                if qc == '"' {
                    end = Some(i);
                    break;
                }
            }
            let end = end.ok_or_else(|| {
                EnvboxError::Configuration(format!("unterminated string literal in '{action}'"))
            })?;
            tokens.push(Token::Literal(action[start..end].to_string()));
        } else {
            let start = index;
            let mut end = action.len();
            while let Some(&(i, wc)) = chars.peek() {
                if wc.is_whitespace() {
                    end = i;
                    break;
                }
                chars.next();
            }
            let word = &action[start..end];
            if let Some(name) = word.strip_prefix('.') {
                tokens.push(Token::Variable(name.to_string()));
            } else {
                tokens.push(Token::Literal(word.to_string()));
            }
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_variable_substitution() {
        let vars = TemplateVars::new().set("Version", "v2.86.0");
        assert_eq!(render("cli-{{.Version}}", &vars).unwrap(), "cli-v2.86.0");
    }

    #[test]
    fn trim_v_strips_only_a_leading_v() {
        let vars = TemplateVars::new().set("Version", "v1.2.3");
        assert_eq!(render("{{trimV .Version}}", &vars).unwrap(), "1.2.3");

        let bare = TemplateVars::new().set("Version", "1.2.3");
        assert_eq!(render("{{trimV .Version}}", &bare).unwrap(), "1.2.3");
    }

    #[test]
    fn release_asset_template_renders() {
        let vars = TemplateVars::for_artifact("v2.86.0", "macOS", "arm64");
        let rendered = render("gh_{{trimV .Version}}_{{.OS}}_{{.Arch}}.tar.gz", &vars).unwrap();
        assert_eq!(rendered, "gh_2.86.0_macOS_arm64.tar.gz");
    }

    #[test]
    fn trim_prefix_accepts_both_argument_orders() {
        let vars = TemplateVars::new().set("Version", "release-1.0");
        assert_eq!(
            render("{{trimPrefix \"release-\" .Version}}", &vars).unwrap(),
            "1.0"
        );
        assert_eq!(
            render("{{trimPrefix .Version \"release-\"}}", &vars).unwrap(),
            "1.0"
        );
    }

    #[test]
    fn unknown_variables_and_functions_error() {
        let vars = TemplateVars::new();
        assert!(render("{{.Missing}}", &vars).is_err());
        assert!(render("{{upper .Missing}}", &vars).is_err());
        assert!(render("{{.Unterminated", &vars).is_err());
    }
}
