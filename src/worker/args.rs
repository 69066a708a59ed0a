//! Argument placeholder resolution and command-line rendering.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

/// `$NAME` where NAME is upper snake case.
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([A-Z_][A-Z0-9_]*)").expect("placeholder regex is valid"));

/// Replace `$NAME` tokens with values from `env`. Unknown names are left
/// exactly as written. The result is still a single argv element.
pub fn substitute(arg: &str, env: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(arg, |caps: &Captures| match env.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Resolve placeholders in every argument.
pub fn substitute_all(args: &[String], env: &HashMap<String, String>) -> Vec<String> {
    args.iter().map(|arg| substitute(arg, env)).collect()
}

/// Render `program args...` for logs, single-quoting anything a shell would
/// split or expand.
pub fn display_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(quote)
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn resolves_known_placeholder() {
        let env = env(&[("HOME", "/tmp")]);
        assert_eq!(substitute("$HOME/out.txt", &env), "/tmp/out.txt");
    }

    #[test]
    fn unresolved_placeholder_passes_through() {
        let env = env(&[]);
        assert_eq!(substitute("$MISSING/x", &env), "$MISSING/x");
    }

    #[test]
    fn lowercase_names_are_not_placeholders() {
        let env = env(&[("home", "/nope"), ("HOME", "/tmp")]);
        assert_eq!(substitute("$home", &env), "$home");
    }

    #[test]
    fn multiple_placeholders_in_one_arg() {
        let env = env(&[("A", "1"), ("B_2", "two")]);
        assert_eq!(substitute("$A-$B_2-$C", &env), "1-two-$C");
    }

    #[test]
    fn substituted_value_with_spaces_stays_one_arg() {
        let env = env(&[("MSG", "hello world")]);
        let args = substitute_all(&["--say".into(), "$MSG".into()], &env);
        assert_eq!(args, vec!["--say".to_string(), "hello world".to_string()]);
    }

    #[test]
    fn display_quotes_unsafe_args() {
        let rendered = display_command(
            "echo",
            &["plain".into(), "two words".into(), "it's".into(), "".into()],
        );
        assert_eq!(rendered, r#"echo plain 'two words' 'it'\''s' ''"#);
    }

    #[test]
    fn display_leaves_paths_alone() {
        let rendered = display_command("/usr/bin/env", &["--x=1".into(), "/tmp/out.txt".into()]);
        assert_eq!(rendered, "/usr/bin/env --x=1 /tmp/out.txt");
    }
}
