//! Name templating
//!
//! Substitutes `{key}` placeholders with annotation values. Placeholders
//! without a matching annotation are left verbatim.

use super::annotations::AnnotationSet;

/// Render `template` against `values`
pub fn render(template: &str, values: &AnnotationSet) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        // A placeholder needs at least one character between the braces
        let Some(close) = rest[open + 1..]
            .char_indices()
            .skip(1)
            .find(|(_, c)| *c == '}')
            .map(|(i, _)| open + 1 + i)
        else {
            break;
        };

        out.push_str(&rest[..open]);
        let key = &rest[open + 1..close];
        match values.get(key) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[open..=close]),
        }
        rest = &rest[close + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn values(pairs: &[(&str, &str)]) -> AnnotationSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_substitutes_known_keys() {
        let v = values(&[("a", "ns"), ("b", "pvc1")]);
        assert_eq!(render("{a}-{b}-x", &v), "ns-pvc1-x");
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let v = values(&[("a", "x")]);
        assert_eq!(render("{a}-{missing}", &v), "x-{missing}");
    }

    #[test]
    fn test_render_keys_with_slashes() {
        let v = values(&[("zfs-pv-provisioner.io/pvc-name", "data")]);
        assert_eq!(render("pv-{zfs-pv-provisioner.io/pvc-name}", &v), "pv-data");
    }

    #[test]
    fn test_render_edge_cases() {
        let v = values(&[("a", "1")]);
        assert_eq!(render("", &v), "");
        assert_eq!(render("plain", &v), "plain");
        assert_eq!(render("{a", &v), "{a");
        assert_eq!(render("{}", &v), "{}");
        assert_eq!(render("{{a}", &v), "{{a}");
        assert_eq!(render("{a}}", &v), "1}");
    }

    proptest! {
        #[test]
        fn prop_text_without_braces_is_unchanged(s in "[^{}]*") {
            prop_assert_eq!(render(&s, &values(&[("a", "1")])), s);
        }

        #[test]
        fn prop_known_key_is_replaced(key in "[a-z][a-z0-9-]{0,12}", value in "[a-z0-9]{0,12}") {
            let v = values(&[(key.as_str(), value.as_str())]);
            prop_assert_eq!(render(&format!("<{{{}}}>", key), &v), format!("<{}>", value));
        }
    }
}
