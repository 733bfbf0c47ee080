//! A small dotted-path / bracket-index reader over `serde_json::Value`.
//!
//! Source mappings in this crate only ever need "reach into an object and
//! read a scalar, or reach into an array and iterate it" (§4.2, §4.4) — a
//! hand-rolled subset is simpler and more auditable than pulling in a full
//! JSONPath engine for that. Missing paths yield `None`/`&[]` rather than
//! erroring, matching §4.2 ("missing paths yield empty values").

use serde_json::Value;

/// Splits `a.b[2].c` into `["a", "b", "[2]", "c"]`-style segments, treating
/// a bare `[]` as "every element of the array here".
fn segments(path: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    for raw in path.split('.') {
        if raw.is_empty() {
            continue;
        }
        let mut rest = raw;
        if let Some(bracket) = rest.find('[') {
            let (field, tail) = rest.split_at(bracket);
            if !field.is_empty() {
                out.push(Segment::Field(field));
            }
            let mut tail = tail;
            while let Some(end) = tail.find(']') {
                let inner = &tail[1..end];
                if inner.is_empty() {
                    out.push(Segment::AllElements);
                } else if let Ok(idx) = inner.parse::<usize>() {
                    out.push(Segment::Index(idx));
                }
                tail = &tail[end + 1..];
            }
            rest = "";
        }
        if !rest.is_empty() {
            out.push(Segment::Field(rest));
        }
    }
    out
}

enum Segment<'a> {
    Field(&'a str),
    Index(usize),
    AllElements,
}

/// Reads a single scalar/object value at `path`. Stops and returns `None`
/// as soon as any segment is missing or the wrong shape, and short-circuits
/// on an `AllElements` segment (use `get_list` for that case instead).
pub fn get_path<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        return Some(root);
    }
    let mut cur = root;
    for seg in segments(path) {
        cur = match seg {
            Segment::Field(name) => cur.get(name)?,
            Segment::Index(idx) => cur.get(idx)?,
            Segment::AllElements => return None,
        };
    }
    Some(cur)
}

/// Resolves a path containing exactly one `[]` wildcard into the list of
/// matching values, e.g. `status.findings[].id` reads the array at
/// `status.findings` and then `id` off each element. A path with no `[]`
/// wildcard is treated as "the value at this path, itself expected to be
/// an array".
pub fn get_list<'v>(root: &'v Value, path: &str) -> Vec<&'v Value> {
    let segs = segments(path);
    let Some(wildcard_pos) = segs.iter().position(|s| matches!(s, Segment::AllElements)) else {
        return match get_path(root, path) {
            Some(Value::Array(items)) => items.iter().collect(),
            _ => Vec::new(),
        };
    };

    let mut cur = root;
    for seg in &segs[..wildcard_pos] {
        let Some(next) = (match seg {
            Segment::Field(name) => cur.get(name),
            Segment::Index(idx) => cur.get(idx),
            Segment::AllElements => None,
        }) else {
            return Vec::new();
        };
        cur = next;
    }
    let Value::Array(items) = cur else {
        return Vec::new();
    };

    let tail = &segs[wildcard_pos + 1..];
    if tail.is_empty() {
        return items.iter().collect();
    }
    items
        .iter()
        .filter_map(|item| {
            let mut cur = item;
            for seg in tail {
                cur = match seg {
                    Segment::Field(name) => cur.get(name)?,
                    Segment::Index(idx) => cur.get(idx)?,
                    Segment::AllElements => return None,
                };
            }
            Some(cur)
        })
        .collect()
}

/// Reads a path and renders it as a `String` regardless of the underlying
/// JSON scalar type (numbers/bools are stringified; objects/arrays are
/// rendered as compact JSON).
pub fn get_string(root: &Value, path: &str) -> Option<String> {
    get_path(root, path).map(value_to_string)
}

pub fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_nested_scalar() {
        let v = json!({"status": {"severity": "HIGH"}});
        assert_eq!(get_string(&v, "status.severity").unwrap(), "HIGH");
    }

    #[test]
    fn missing_path_yields_none() {
        let v = json!({"status": {}});
        assert!(get_path(&v, "status.missing").is_none());
    }

    #[test]
    fn wildcard_extracts_field_from_each_element() {
        let v = json!({"status": {"findings": [{"id": "a"}, {"id": "b"}]}});
        let ids: Vec<String> = get_list(&v, "status.findings[].id")
            .into_iter()
            .map(value_to_string)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn bare_array_path_returns_elements() {
        let v = json!({"items": [1, 2, 3]});
        assert_eq!(get_list(&v, "items").len(), 3);
    }

    #[test]
    fn indexed_segment_reads_one_element() {
        let v = json!({"items": [{"x": 1}, {"x": 2}]});
        assert_eq!(get_path(&v, "items[1].x").unwrap(), &json!(2));
    }
}
