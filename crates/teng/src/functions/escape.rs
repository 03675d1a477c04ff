//! Escaping builtins tied to the active content type.

use std::fmt::Write;

use crate::value::Value;

use super::{FunctionCtx, FunctionResult};

/// `escape(str)`: escapes through the current content type.
pub(super) fn escape<'a>(args: &[Value<'a>], ctx: &mut FunctionCtx<'_>) -> FunctionResult<'a> {
    let [arg] = args else {
        return Err("escape(): invalid number of arguments".to_owned());
    };
    Ok(Value::String(ctx.escaper.escape(&arg.to_string_value())))
}

/// `unescape(str)`: undoes the current content type's escaping.
///
/// When applied directly to a variable the parser optimizes the call away by
/// clearing the variable's escape flag instead; this handler covers every
/// other operand shape.
pub(super) fn unescape<'a>(args: &[Value<'a>], ctx: &mut FunctionCtx<'_>) -> FunctionResult<'a> {
    let [arg] = args else {
        return Err("unescape(): invalid number of arguments".to_owned());
    };
    Ok(Value::String(ctx.escaper.unescape(&arg.to_string_value())))
}

/// `urlescape(str)`: percent-encodes everything except `[A-Za-z0-9_./-]`.
pub(super) fn urlescape<'a>(args: &[Value<'a>], _: &mut FunctionCtx<'_>) -> FunctionResult<'a> {
    let [arg] = args else {
        return Err("urlescape(): invalid number of arguments".to_owned());
    };
    let text = arg.to_string_value();
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-' | b'.' | b'/') {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    Ok(Value::String(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        contenttype::{Escaper, default_descriptor, find_descriptor},
        error::ErrorLog,
        position::Position,
    };

    #[test]
    fn escape_uses_content_type() {
        let mut log = ErrorLog::new();
        let pos = Position::whole_file(None);
        let html = find_descriptor("html", &pos, &mut log);
        let mut escaper = Escaper::new(default_descriptor());
        escaper.push(html.index, &pos, &mut log);

        let mut ctx = FunctionCtx::new(&escaper, "utf-8");
        let args = [Value::String("<a>".to_owned())];
        let Ok(Value::String(s)) = escape(&args, &mut ctx) else {
            panic!()
        };
        assert_eq!(s, "&lt;a&gt;");

        let args = [Value::String("&lt;a&gt;".to_owned())];
        let Ok(Value::String(s)) = unescape(&args, &mut ctx) else {
            panic!()
        };
        assert_eq!(s, "<a>");
    }

    #[test]
    fn urlescape_bytes() {
        let escaper = Escaper::new(default_descriptor());
        let mut ctx = FunctionCtx::new(&escaper, "utf-8");
        let args = [Value::String("a b/ž?".to_owned())];
        let Ok(Value::String(s)) = urlescape(&args, &mut ctx) else {
            panic!()
        };
        assert_eq!(s, "a%20b/%C5%BE%3F");
    }
}
