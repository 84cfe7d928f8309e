/// Replace `${ENV_VAR}` placeholders in config string values.
///
/// Unresolvable variables are left as-is.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

/// Replace `${ENV_VAR}` placeholders using a custom lookup function.
///
/// `${NAME:-fallback}` expands to `fallback` when `NAME` is unset or empty.
/// An unterminated `${` is copied through verbatim.
pub(crate) fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let body = &after[..end];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };

        match (lookup(name), fallback) {
            _ if name.is_empty() => out.push_str(&rest[start..start + 3 + end]),
            (Some(value), Some(fallback)) if value.is_empty() => out.push_str(fallback),
            (Some(value), _) => out.push_str(&value),
            (None, Some(fallback)) => out.push_str(fallback),
            (None, None) => out.push_str(&rest[start..start + 3 + end]),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_var() {
        let lookup = |name: &str| match name {
            "CQLINK_TEST_VAR" => Some("hello".to_string()),
            _ => None,
        };
        assert_eq!(
            substitute_env_with("key=${CQLINK_TEST_VAR}", lookup),
            "key=hello"
        );
    }

    #[test]
    fn leaves_unknown_var() {
        let lookup = |_: &str| None;
        assert_eq!(
            substitute_env_with("${CQLINK_NONEXISTENT_XYZ}", lookup),
            "${CQLINK_NONEXISTENT_XYZ}"
        );
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        let lookup = |_: &str| Some("x".to_string());
        assert_eq!(substitute_env_with("url=${HOST", lookup), "url=${HOST");
    }

    #[test]
    fn substitutes_several_in_one_line() {
        let lookup = |name: &str| match name {
            "HOST" => Some("10.0.0.1".to_string()),
            "PORT" => Some("6700".to_string()),
            _ => None,
        };
        assert_eq!(
            substitute_env_with("ws://${HOST}:${PORT}/", lookup),
            "ws://10.0.0.1:6700/"
        );
    }

    #[test]
    fn fallback_applies_when_unset_or_empty() {
        let lookup = |name: &str| match name {
            "EMPTY" => Some(String::new()),
            "SET" => Some("real".to_string()),
            _ => None,
        };
        assert_eq!(substitute_env_with("${MISSING:-a}", lookup), "a");
        assert_eq!(substitute_env_with("${EMPTY:-b}", lookup), "b");
        assert_eq!(substitute_env_with("${SET:-c}", lookup), "real");
    }

    #[test]
    fn empty_name_is_literal() {
        assert_eq!(substitute_env_with("a${}b", |_| Some("x".into())), "a${}b");
    }

    #[test]
    fn no_placeholders() {
        assert_eq!(substitute_env("plain text"), "plain text");
    }
}
