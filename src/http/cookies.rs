//! `Set-Cookie` attribute rewriting.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::config::schema::CookieRewrite;

static DOMAIN_ATTR: Lazy<Regex> = Lazy::new(|| attribute_pattern("domain"));
static PATH_ATTR: Lazy<Regex> = Lazy::new(|| attribute_pattern("path"));

fn attribute_pattern(property: &str) -> Regex {
    Regex::new(&format!(r"(?i)(;\s*{}=)([^;]+)", regex::escape(property)))
        .expect("valid regex")
}

/// Rewrite the first `property` attribute of a cookie according to `rule`.
///
/// A matching rule with an empty value removes the attribute; a cookie
/// without a matching rule is returned unchanged.
pub fn rewrite_cookie_property(cookie: &str, rule: &CookieRewrite, property: &str) -> String {
    let pattern: Cow<'_, Regex> = match property.to_ascii_lowercase().as_str() {
        "domain" => Cow::Borrowed(&*DOMAIN_ATTR),
        "path" => Cow::Borrowed(&*PATH_ATTR),
        other => Cow::Owned(attribute_pattern(other)),
    };

    pattern
        .replacen(cookie, 1, |caps: &Captures<'_>| {
            let previous = &caps[2];
            match rule.lookup(previous) {
                Some("") => String::new(),
                Some(replacement) => format!("{}{}", &caps[1], replacement),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn rules(pairs: &[(&str, &str)]) -> CookieRewrite {
        CookieRewrite::Rules(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[test]
    fn test_domain_rewrite() {
        let rule = rules(&[("old.com", "new.com")]);
        assert_eq!(
            rewrite_cookie_property("id=1; domain=old.com; path=/", &rule, "domain"),
            "id=1; domain=new.com; path=/"
        );
    }

    #[test]
    fn test_wildcard_removal() {
        let rule = rules(&[("*", "")]);
        assert_eq!(
            rewrite_cookie_property("id=1; domain=old.com; path=/", &rule, "domain"),
            "id=1; path=/"
        );
    }

    #[test]
    fn test_unmatched_cookie_is_untouched() {
        let rule = rules(&[("other.com", "new.com")]);
        let cookie = "id=1; Domain=old.com; path=/";
        assert_eq!(rewrite_cookie_property(cookie, &rule, "domain"), cookie);
    }

    #[test]
    fn test_string_rule_applies_everywhere() {
        let rule = CookieRewrite::Wildcard("/api".into());
        assert_eq!(
            rewrite_cookie_property("hello-world=1; Path=/; HttpOnly", &rule, "path"),
            "hello-world=1; Path=/api; HttpOnly"
        );
    }

    #[test]
    fn test_only_first_attribute_is_rewritten() {
        let rule = rules(&[("*", "x.com")]);
        assert_eq!(
            rewrite_cookie_property("a=1; domain=a.com; domain=b.com", &rule, "domain"),
            "a=1; domain=x.com; domain=b.com"
        );
    }

    #[test]
    fn test_disabled_rule() {
        let cookie = "a=1; path=/";
        assert_eq!(rewrite_cookie_property(cookie, &CookieRewrite::Disabled, "path"), cookie);
    }
}
