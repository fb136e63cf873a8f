//! Method descriptor formatting
//!
//! Turns a JVM method descriptor into the human readable parameter list used
//! in artifact keys:
//!
//! ```text
//! class  com/example/Orders
//! method place
//! desc   (ILjava/lang/String;[[J)Z
//!   ──►  com.example.Orders.place(int,java.lang.String,long[][])
//! ```
//!
//! The return type is validated but never rendered.

use thiserror::Error;

/// A descriptor that is not a well-formed JVM method descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("malformed method descriptor `{descriptor}` at position {position}: {reason}")]
    Malformed {
        descriptor: String,
        position: usize,
        reason: &'static str,
    },
}

fn malformed(descriptor: &str, position: usize, reason: &'static str) -> DescriptorError {
    DescriptorError::Malformed {
        descriptor: descriptor.to_string(),
        position,
        reason,
    }
}

fn primitive_keyword(code: u8) -> Option<&'static str> {
    Some(match code {
        b'B' => "byte",
        b'C' => "char",
        b'D' => "double",
        b'F' => "float",
        b'I' => "int",
        b'J' => "long",
        b'S' => "short",
        b'Z' => "boolean",
        _ => return None,
    })
}

/// Convert an internal class name (`a/b/C`) to its dotted form.
pub fn dotted(name: &str) -> String {
    name.replace('/', ".")
}

/// Read one field type starting at `pos`; returns the rendered type and the
/// position just after it.
fn read_type(descriptor: &str, pos: usize) -> Result<(String, usize), DescriptorError> {
    let bytes = descriptor.as_bytes();
    let mut pos = pos;
    let mut dimensions = 0usize;

    while bytes.get(pos) == Some(&b'[') {
        dimensions += 1;
        pos += 1;
    }

    let code = *bytes
        .get(pos)
        .ok_or_else(|| malformed(descriptor, pos, "missing type after array marker"))?;

    let mut rendered = if let Some(keyword) = primitive_keyword(code) {
        pos += 1;
        keyword.to_string()
    } else if code == b'L' {
        let start = pos + 1;
        let end = descriptor[start..]
            .find(';')
            .map(|i| start + i)
            .ok_or_else(|| malformed(descriptor, pos, "unterminated class type"))?;
        if end == start {
            return Err(malformed(descriptor, pos, "empty class name"));
        }
        pos = end + 1;
        dotted(&descriptor[start..end])
    } else {
        return Err(malformed(descriptor, pos, "unknown type code"));
    };

    for _ in 0..dimensions {
        rendered.push_str("[]");
    }
    Ok((rendered, pos))
}

/// Render the parameter list of a method descriptor, comma separated,
/// without the surrounding parentheses.
pub fn format_parameters(descriptor: &str) -> Result<String, DescriptorError> {
    let bytes = descriptor.as_bytes();
    if bytes.first() != Some(&b'(') {
        return Err(malformed(descriptor, 0, "expected `(`"));
    }

    let mut params: Vec<String> = Vec::new();
    let mut pos = 1;
    loop {
        match bytes.get(pos) {
            None => return Err(malformed(descriptor, pos, "missing `)`")),
            Some(b')') => {
                pos += 1;
                break;
            }
            Some(b'V') => return Err(malformed(descriptor, pos, "void parameter")),
            Some(_) => {
                let (param, next) = read_type(descriptor, pos)?;
                params.push(param);
                pos = next;
            }
        }
    }

    // Return type: `V` or exactly one field type, nothing after it.
    let end = if bytes.get(pos) == Some(&b'V') {
        pos + 1
    } else {
        read_type(descriptor, pos)?.1
    };
    if end != bytes.len() {
        return Err(malformed(descriptor, end, "trailing characters"));
    }

    Ok(params.join(","))
}

/// Build the artifact key `<class>.<method>(<params>)`.
///
/// `class_name` may be given in internal (`a/b/C`) or dotted form.
pub fn format_artifact_key(
    class_name: &str,
    method_name: &str,
    descriptor: &str,
) -> Result<String, DescriptorError> {
    let params = format_parameters(descriptor)?;
    Ok(format!("{}.{}({})", dotted(class_name), method_name, params))
}
