// src/template.rs

//! Placeholder substitution for command lines and log file names.
//!
//! Two forms are recognised:
//! - `${NAME}`: replaced by the value of `NAME`.
//! - `$NAME`: replaced by the value of the *longest* known variable whose
//!   name is a prefix of the identifier following `$`. This lets
//!   `$SERVICE_$PROCID_$RUN.out` expand to `tidb_10000_0.out` even though
//!   `_` is an identifier character.
//!
//! Placeholders that match no variable are left verbatim.

use std::collections::HashMap;

/// Expand every recognised placeholder in `input`.
pub fn expand(input: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                let name = &braced[..end];
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &braced[end + 1..];
                continue;
            }
            out.push('$');
            rest = after;
            continue;
        }

        let ident_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        let ident = &after[..ident_len];

        match longest_known_prefix(ident, vars) {
            Some((len, value)) => {
                out.push_str(value);
                rest = &after[len..];
            }
            None => {
                out.push('$');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

/// Expand every element of a list.
pub fn expand_all(items: &[String], vars: &HashMap<String, String>) -> Vec<String> {
    items.iter().map(|s| expand(s, vars)).collect()
}

fn longest_known_prefix<'a>(
    ident: &str,
    vars: &'a HashMap<String, String>,
) -> Option<(usize, &'a str)> {
    (1..=ident.len())
        .rev()
        .find_map(|len| vars.get(&ident[..len]).map(|v| (len, v.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn expands_log_file_template() {
        let v = vars(&[("SERVICE", "tidb"), ("PROCID", "10000"), ("RUN", "0")]);
        assert_eq!(expand("$SERVICE_$PROCID_$RUN.out", &v), "tidb_10000_0.out");
    }

    #[test]
    fn braced_and_longest_match() {
        let v = vars(&[("HOST", "h"), ("HOST_IP", "10.0.0.1"), ("PD_ADDR", "x:1")]);
        assert_eq!(expand("${HOST_IP}:1234", &v), "10.0.0.1:1234");
        assert_eq!(expand("$HOST_IP:1234", &v), "10.0.0.1:1234");
        assert_eq!(expand("$HOSTNAME", &v), "hNAME");
        assert_eq!(expand("$PD_ADDR/pd?cluster=1", &v), "x:1/pd?cluster=1");
    }

    #[test]
    fn unknown_placeholders_stay_verbatim() {
        let v = vars(&[("A", "1")]);
        assert_eq!(expand("$MISSING and ${ALSO_MISSING}", &v), "$MISSING and ${ALSO_MISSING}");
        assert_eq!(expand("cost: $5 ${unterminated", &v), "cost: $5 ${unterminated");
        assert_eq!(expand("trailing $", &v), "trailing $");
    }

    proptest! {
        #[test]
        fn text_without_dollar_is_untouched(s in "[^$]*") {
            let v = vars(&[("A", "1"), ("B", "2")]);
            prop_assert_eq!(expand(&s, &v), s);
        }

        #[test]
        fn empty_vars_is_identity(s in ".*") {
            prop_assert_eq!(expand(&s, &HashMap::new()), s);
        }
    }
}
