//! Parser for the switch's connection-tracker dump format.
//!
//! One line per connection: a leading bare protocol token, then
//! comma-separated `key=value` pairs where a value may itself be a nested,
//! parenthesized `key=value` group (the `orig=(...)`/`reply=(...)` tuples).
//! The parser is a recursive descent over an explicit cursor; malformed
//! nesting surfaces as a `Parse` error instead of a best-effort partial
//! result.

use std::collections::BTreeMap;

use fabric_common::{FabricError, FabricResult};

/// A parsed value: either a scalar or a nested group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnValue {
    /// A scalar string value.
    Scalar(String),
    /// A nested `(key=value,...)` group.
    Nested(BTreeMap<String, ConnValue>),
}

impl ConnValue {
    /// The scalar value, if this is one.
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            ConnValue::Scalar(s) => Some(s),
            ConnValue::Nested(_) => None,
        }
    }

    /// The nested group, if this is one.
    pub fn as_nested(&self) -> Option<&BTreeMap<String, ConnValue>> {
        match self {
            ConnValue::Scalar(_) => None,
            ConnValue::Nested(m) => Some(m),
        }
    }
}

/// One tracked connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// The leading protocol token.
    pub proto: String,
    /// Everything after the protocol token.
    pub fields: BTreeMap<String, ConnValue>,
}

/// Parses one group of comma-separated `key=value` pairs starting at the
/// beginning of `s`. Returns the fields and the number of bytes consumed;
/// for a nested group the consumed count includes the closing `)`, so the
/// caller can advance past it.
fn parse_group(s: &str, nested: bool) -> FabricResult<(BTreeMap<String, ConnValue>, usize)> {
    let mut fields = BTreeMap::new();
    let mut cursor = 0;
    let bytes = s.as_bytes();

    loop {
        if cursor >= s.len() {
            if nested {
                return Err(FabricError::parse("unterminated nested group"));
            }
            return Ok((fields, cursor));
        }
        if bytes[cursor] == b')' {
            if nested {
                // The group closes; consumption includes the ')'.
                return Ok((fields, cursor + 1));
            }
            return Err(FabricError::parse(format!(
                "unbalanced ')' at offset {cursor}"
            )));
        }

        let Some(eq) = s[cursor..].find('=') else {
            // No further pair. A nested group reaching here lost its ')'.
            if nested {
                return Err(FabricError::parse("unterminated nested group"));
            }
            return Ok((fields, s.len()));
        };
        let key = &s[cursor..cursor + eq];
        if key.contains(['(', ')', ',']) {
            return Err(FabricError::parse(format!("malformed key '{key}'")));
        }
        cursor += eq + 1;

        if cursor < s.len() && bytes[cursor] == b'(' {
            cursor += 1;
            let (inner, consumed) = parse_group(&s[cursor..], true)?;
            cursor += consumed;
            fields.insert(key.to_string(), ConnValue::Nested(inner));
        } else {
            let rest = &s[cursor..];
            let end = rest.find([',', ')']).unwrap_or(rest.len());
            fields.insert(
                key.to_string(),
                ConnValue::Scalar(rest[..end].to_string()),
            );
            cursor += end;
            if cursor < s.len() && bytes[cursor] == b')' {
                // A ')' terminating a scalar closes the current group; the
                // enclosing level must not scan our siblings as its own.
                if nested {
                    return Ok((fields, cursor + 1));
                }
                return Err(FabricError::parse(format!(
                    "unbalanced ')' at offset {cursor}"
                )));
            }
        }

        if cursor < s.len() && bytes[cursor] == b',' {
            cursor += 1;
        }
    }
}

/// Parses a full connection dump, one connection per line.
pub fn parse_connections(dump: &str) -> FabricResult<Vec<Connection>> {
    let mut conns = Vec::new();
    for line in dump.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (proto, rest) = match line.find(',') {
            Some(pos) => (&line[..pos], &line[pos + 1..]),
            None => (line, ""),
        };
        let (fields, _) = parse_group(rest, false)?;
        conns.push(Connection {
            proto: proto.to_string(),
            fields,
        });
    }
    Ok(conns)
}

/// Counts live connections, optionally restricted to one protocol.
pub fn count_connections(conns: &[Connection], proto: Option<&str>) -> usize {
    conns
        .iter()
        .filter(|c| proto.is_none_or(|p| c.proto == p))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn scalar(s: &str) -> ConnValue {
        ConnValue::Scalar(s.to_string())
    }

    #[test]
    fn test_parse_nested_tuples() {
        let conns = parse_connections(
            "tcp,orig=(src=1.2.3.4,dst=5.6.7.8),reply=(src=5.6.7.8,dst=1.2.3.4)",
        )
        .unwrap();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].proto, "tcp");

        let orig = conns[0].fields["orig"].as_nested().unwrap();
        assert_eq!(orig["src"], scalar("1.2.3.4"));
        assert_eq!(orig["dst"], scalar("5.6.7.8"));

        let reply = conns[0].fields["reply"].as_nested().unwrap();
        assert_eq!(reply["src"], scalar("5.6.7.8"));
        assert_eq!(reply["dst"], scalar("1.2.3.4"));
    }

    #[test]
    fn test_scalar_after_nested_group() {
        let conns = parse_connections(
            "udp,orig=(src=1.1.1.1,sport=1000),zone=200,mark=0",
        )
        .unwrap();
        let conn = &conns[0];
        assert_eq!(conn.fields["zone"], scalar("200"));
        // The final scalar runs to end of line and keeps its last character.
        assert_eq!(conn.fields["mark"], scalar("0"));
    }

    #[test]
    fn test_parse_multiple_lines() {
        let dump = "tcp,orig=(src=1.1.1.1),zone=200\n\
                    tcp,orig=(src=2.2.2.2),zone=200\n\
                    udp,orig=(src=3.3.3.3),zone=201\n";
        let conns = parse_connections(dump).unwrap();
        assert_eq!(conns.len(), 3);
        assert_eq!(count_connections(&conns, Some("tcp")), 2);
        assert_eq!(count_connections(&conns, Some("udp")), 1);
        assert_eq!(count_connections(&conns, Some("icmp")), 0);
        assert_eq!(count_connections(&conns, None), 3);
    }

    #[test]
    fn test_deeply_nested_groups() {
        let conns =
            parse_connections("tcp,protoinfo=(tcp=(state=ESTABLISHED,wscale=7)),zone=1")
                .unwrap();
        let protoinfo = conns[0].fields["protoinfo"].as_nested().unwrap();
        let tcp = protoinfo["tcp"].as_nested().unwrap();
        assert_eq!(tcp["state"], scalar("ESTABLISHED"));
        assert_eq!(conns[0].fields["zone"], scalar("1"));
    }

    #[test]
    fn test_unterminated_group_is_parse_error() {
        let err = parse_connections("tcp,orig=(src=1.2.3.4").unwrap_err();
        assert!(matches!(err, FabricError::Parse { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_unbalanced_close_is_parse_error() {
        let err = parse_connections("tcp,zone=1),orig=(src=1.2.3.4)").unwrap_err();
        assert!(matches!(err, FabricError::Parse { .. }));
    }

    #[test]
    fn test_proto_only_line() {
        let conns = parse_connections("icmp\n").unwrap();
        assert_eq!(conns[0].proto, "icmp");
        assert!(conns[0].fields.is_empty());
    }
}
