//! Path queries over an object's JSON form.
//!
//! Supported forms: `.` (root), `.a.b`, `.a["dotted.key"]`, `.a[0]`, `.a[]`
//! (every element of an array or value of a map). `null` results count as
//! absent.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
    Each,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    raw: String,
    segments: Vec<Segment>,
}

impl Query {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        let segments = parse_segments(trimmed)?;
        Ok(Self { raw: trimmed.to_string(), segments })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// All non-null values the query resolves to.
    pub fn eval<'a>(&self, data: &'a Value) -> Vec<&'a Value> {
        let mut cur = vec![data];
        for seg in &self.segments {
            let mut next = Vec::with_capacity(cur.len());
            for v in cur {
                match seg {
                    Segment::Field(k) => next.extend(v.get(k.as_str())),
                    Segment::Index(i) => next.extend(v.as_array().and_then(|a| a.get(*i))),
                    Segment::Each => match v {
                        Value::Array(items) => next.extend(items.iter()),
                        Value::Object(map) => next.extend(map.values()),
                        _ => {}
                    },
                }
            }
            cur = next;
        }
        cur.retain(|v| !v.is_null());
        cur
    }

    pub fn first<'a>(&self, data: &'a Value) -> Option<&'a Value> {
        self.eval(data).into_iter().next()
    }
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

fn parse_segments(s: &str) -> Result<Vec<Segment>, String> {
    let bytes = s.as_bytes();
    if bytes.first() != Some(&b'.') {
        return Err("query must start with '.'".to_string());
    }
    let mut out = Vec::new();
    let mut i = 1;
    // true right after a '.' separator
    let mut expect_name = true;
    while i < bytes.len() {
        match bytes[i] {
            b'[' => {
                let (seg, next) = parse_bracket(s, i)?;
                out.push(seg);
                i = next;
                expect_name = false;
            }
            b'.' if !expect_name => {
                i += 1;
                expect_name = true;
            }
            b if expect_name && is_name_byte(b) => {
                let start = i;
                while i < bytes.len() && is_name_byte(bytes[i]) {
                    i += 1;
                }
                out.push(Segment::Field(s[start..i].to_string()));
                expect_name = false;
            }
            _ => {
                let ch = s[i..].chars().next().unwrap_or_default();
                return Err(format!("unexpected {:?} at offset {}", ch, i));
            }
        }
    }
    if expect_name && !out.is_empty() {
        return Err("trailing '.'".to_string());
    }
    Ok(out)
}

fn parse_bracket(s: &str, open: usize) -> Result<(Segment, usize), String> {
    let body = open + 1;
    let rest = &s[body..];
    if rest.starts_with(']') {
        return Ok((Segment::Each, body + 1));
    }
    if let Some(quoted) = rest.strip_prefix('"') {
        let mut key = String::new();
        let mut escaped = false;
        for (off, ch) in quoted.char_indices() {
            if escaped {
                key.push(ch);
                escaped = false;
                continue;
            }
            match ch {
                '\\' => escaped = true,
                '"' => {
                    let after = body + 1 + off + 1;
                    return if s[after..].starts_with(']') {
                        Ok((Segment::Field(key), after + 1))
                    } else {
                        Err(format!("expected ']' at offset {}", after))
                    };
                }
                _ => key.push(ch),
            }
        }
        return Err("unterminated string".to_string());
    }
    let close = rest.find(']').ok_or_else(|| "unterminated '['".to_string())?;
    let inner = rest[..close].trim();
    let idx = inner.parse::<usize>().map_err(|_| format!("invalid index {:?}", inner))?;
    Ok((Segment::Index(idx), body + close + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn q(s: &str) -> Query {
        Query::parse(s).unwrap()
    }

    #[test]
    fn parses_supported_forms() {
        assert!(q(".").segments.is_empty());
        assert_eq!(q(".status.phase").segments, vec![Segment::Field("status".into()), Segment::Field("phase".into())]);
        assert_eq!(
            q(r#".metadata.annotations["fakelet.dev/delay"]"#).segments,
            vec![Segment::Field("metadata".into()), Segment::Field("annotations".into()), Segment::Field("fakelet.dev/delay".into())]
        );
        assert_eq!(
            q(".status.conditions[1].type").segments,
            vec![
                Segment::Field("status".into()),
                Segment::Field("conditions".into()),
                Segment::Index(1),
                Segment::Field("type".into())
            ]
        );
        assert_eq!(q(".spec.taints[].key").segments.len(), 4);
        assert_eq!(q(r#".["a\"b"]"#).segments, vec![Segment::Field("a\"b".into())]);
    }

    #[test]
    fn rejects_malformed_queries() {
        for bad in ["status", ".a.", "..a", ".a[", ".a[x]", r#".a["b"x]"#, r#".a["b"#, ".a b"] {
            assert!(Query::parse(bad).is_err(), "{} should fail", bad);
        }
    }

    #[test]
    fn evaluates_against_json() {
        let data = json!({
            "metadata": {"annotations": {"fakelet.dev/delay": "5s"}},
            "status": {
                "phase": "Pending",
                "podIP": null,
                "conditions": [{"type": "Ready", "status": "False"}, {"type": "Scheduled", "status": "True"}]
            }
        });
        assert_eq!(q(".status.phase").first(&data), Some(&json!("Pending")));
        assert_eq!(q(r#".metadata.annotations["fakelet.dev/delay"]"#).first(&data), Some(&json!("5s")));
        assert_eq!(q(".status.conditions[1].type").first(&data), Some(&json!("Scheduled")));
        let types: Vec<_> = q(".status.conditions[].type").eval(&data);
        assert_eq!(types, vec![&json!("Ready"), &json!("Scheduled")]);
        assert!(q(".status.podIP").eval(&data).is_empty());
        assert!(q(".spec.nodeName").eval(&data).is_empty());
        assert!(q(".status.phase.deeper").eval(&data).is_empty());
        assert_eq!(q(".").eval(&data).len(), 1);
    }
}
