//! A small hand-rolled template renderer for the three constructs the spec allows: `{{path}}`,
//! `{{path | filter(args)}}`, and `{% if EXPR %} … {% else %} … {% endif %}` (design note: "should
//! not import a general template engine"). `EXPR` supports `path == 'literal'` and
//! `path != 'literal'`; filters are the closed set `date`, `upper`, `lower`, `default`.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*(?P<path>[^|}]+?)\s*(?:\|\s*(?P<filter>[a-zA-Z_][a-zA-Z0-9_]*)\((?P<args>[^)]*)\)\s*)?\}\}").unwrap()
});

static COND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^(?P<path>\S+)\s*(?P<op>==|!=)\s*'(?P<value>[^']*)'$"#).unwrap());

/// Renders `template` against `source`, a flattened dot-path → string view of the message being
/// transformed. Unknown paths resolve to the empty string.
pub fn render(template: &str, source: &HashMap<String, String>) -> String {
    let mut text = expand_conditionals(template, source);
    text = expand_placeholders(&text, source);
    text
}

/// One `{% ... %}` directive found by [`next_tag`], with its byte span in the text it was found
/// in (`span.0` is the `{` of `{%`, `span.1` is one past the `}` of `%}`).
enum Tag<'a> {
    If(&'a str),
    Else,
    Endif,
}

fn next_tag(text: &str) -> Option<(usize, usize, Tag<'_>)> {
    let start = text.find("{%")?;
    let rel_close = text[start..].find("%}")?;
    let close = start + rel_close;
    let end = close + 2;
    let inner = text[start + 2..close].trim();
    let tag = if let Some(cond) = inner.strip_prefix("if ") {
        Tag::If(cond.trim())
    } else if inner == "else" {
        Tag::Else
    } else if inner == "endif" {
        Tag::Endif
    } else {
        return None;
    };
    Some((start, end, tag))
}

/// Expands `{% if %} … {% else %} … {% endif %}` blocks, tracking nesting depth so an `if` whose
/// branch itself contains a conditional renders both levels correctly (needed for three-way
/// mappings like HL7 gender codes, which need two binary branches to express).
fn expand_conditionals(template: &str, source: &HashMap<String, String>) -> String {
    let mut result = String::new();
    let mut rest = template;
    loop {
        match next_tag(rest) {
            None => {
                result.push_str(rest);
                break;
            }
            Some((start, if_end, Tag::If(cond))) => {
                result.push_str(&rest[..start]);
                let cond = cond.to_string();
                let body = &rest[if_end..];

                let mut depth = 1usize;
                let mut cursor = 0usize;
                let mut else_start: Option<usize> = None;
                let mut endif_span: Option<(usize, usize)> = None;
                while let Some((s, e, tag)) = next_tag(&body[cursor..]) {
                    let abs_start = cursor + s;
                    let abs_end = cursor + e;
                    match tag {
                        Tag::If(_) => depth += 1,
                        Tag::Else => {
                            if depth == 1 && else_start.is_none() {
                                else_start = Some(abs_start);
                            }
                        }
                        Tag::Endif => {
                            depth -= 1;
                            if depth == 0 {
                                endif_span = Some((abs_start, abs_end));
                                break;
                            }
                        }
                    }
                    cursor = abs_end;
                }

                let Some((endif_start, endif_end)) = endif_span else {
                    // Unterminated if: treat the rest of the template as literal text.
                    result.push_str(&rest[start..]);
                    break;
                };

                let (then_branch, else_branch) = match else_start {
                    Some(else_pos) => {
                        let (_, else_tag_end, _) = next_tag(&body[else_pos..]).unwrap();
                        let else_tag_end = else_pos + else_tag_end;
                        (&body[..else_pos], &body[else_tag_end..endif_start])
                    }
                    None => (&body[..endif_start], ""),
                };

                let chosen = if eval_condition(&cond, source) { then_branch } else { else_branch };
                result.push_str(&expand_conditionals(chosen, source));
                rest = &body[endif_end..];
            }
            Some((_start, end, Tag::Else | Tag::Endif)) => {
                // A stray else/endif with no matching if; pass it through unchanged.
                result.push_str(&rest[..end]);
                rest = &rest[end..];
            }
        }
    }
    result
}

fn eval_condition(cond: &str, source: &HashMap<String, String>) -> bool {
    let Some(caps) = COND.captures(cond.trim()) else {
        return false;
    };
    let path = &caps["path"];
    let expected = &caps["value"];
    let actual = source.get(path).map(String::as_str).unwrap_or("");
    match &caps["op"] {
        "==" => actual == expected,
        "!=" => actual != expected,
        _ => false,
    }
}

fn expand_placeholders(text: &str, source: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &regex::Captures| {
            let path = caps["path"].trim();
            let value = source.get(path).cloned().unwrap_or_default();
            match caps.name("filter") {
                Some(filter) => {
                    let args = caps.name("args").map(|m| m.as_str()).unwrap_or("");
                    apply_filter(filter.as_str(), args, &value)
                }
                None => value,
            }
        })
        .into_owned()
}

fn apply_filter(name: &str, args: &str, value: &str) -> String {
    let arg = args.trim().trim_matches('\'').trim_matches('"');
    match name {
        "upper" => value.to_uppercase(),
        "lower" => value.to_lowercase(),
        "default" => if value.is_empty() { arg.to_string() } else { value.to_string() },
        "date" => format_date(value, arg).unwrap_or_else(|| value.to_string()),
        _ => value.to_string(),
    }
}

/// Reformats an HL7-style date (`YYYYMMDD` or `YYYYMMDDHHMMSS`) into `fmt` (a `chrono`
/// strftime format string, e.g. `%Y-%m-%d`).
fn format_date(value: &str, fmt: &str) -> Option<String> {
    let digits: String = value.chars().take(8).collect();
    if digits.len() < 8 {
        return None;
    }
    let date = NaiveDate::parse_from_str(&digits, "%Y%m%d").ok()?;
    Some(date.format(fmt).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn renders_plain_placeholder() {
        let src = source(&[("PID.5.1", "Doe")]);
        assert_eq!(render("{{PID.5.1}}", &src), "Doe");
    }

    #[test]
    fn renders_date_filter() {
        let src = source(&[("PID.7", "19700101")]);
        assert_eq!(render("{{PID.7 | date('%Y-%m-%d')}}", &src), "1970-01-01");
    }

    #[test]
    fn renders_upper_and_default_filters() {
        let src = source(&[("PID.8", "m")]);
        assert_eq!(render("{{PID.8 | upper()}}", &src), "M");
        let empty = source(&[]);
        assert_eq!(render("{{PID.8 | default('UNK')}}", &empty), "UNK");
    }

    #[test]
    fn renders_conditional_branch() {
        let template = "{% if PID.8 == 'M' %}male{% else %}other{% endif %}";
        let male = source(&[("PID.8", "M")]);
        assert_eq!(render(template, &male), "male");
        let female = source(&[("PID.8", "F")]);
        assert_eq!(render(template, &female), "other");
    }

    #[test]
    fn renders_nested_conditionals_for_three_way_gender_mapping() {
        let template = "{% if PID.8 == 'M' %}male{% else %}{% if PID.8 == 'F' %}female{% else %}unknown{% endif %}{% endif %}";
        assert_eq!(render(template, &source(&[("PID.8", "M")])), "male");
        assert_eq!(render(template, &source(&[("PID.8", "F")])), "female");
        assert_eq!(render(template, &source(&[("PID.8", "O")])), "unknown");
    }
}
