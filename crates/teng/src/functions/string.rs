//! String builtins.

use crate::{
    regex::{RegexFlags, RegexValue},
    value::{Number, Value},
};

use super::{FunctionCtx, FunctionResult};

/// `len(str)`: byte length, or code points under utf-8 encoding.
pub(super) fn len<'a>(args: &[Value<'a>], ctx: &mut FunctionCtx<'_>) -> FunctionResult<'a> {
    let [arg] = args else {
        return Err("len(): invalid number of arguments".to_owned());
    };
    let text = arg.to_string_value();
    let length = if ctx.is_utf8() {
        text.chars().count()
    } else {
        text.len()
    };
    Ok(Value::Int(length as i64))
}

/// Resolves python-style substring bounds against a length.
///
/// Returns the clamped range plus whether each side was clipped (a clipped
/// side keeps its affix, an exact side drops it).
fn substr_bounds(len: usize, mut s: i64, mut e: i64) -> (usize, usize, bool, bool) {
    let ilen = len as i64;
    if s < 0 {
        s += ilen;
    }
    if e < 0 {
        e += ilen;
    }
    let keep_prefix = s > 0;
    let keep_suffix = e < ilen;
    let s = s.clamp(0, ilen) as usize;
    let e = e.clamp(0, ilen) as usize;
    (s, e.max(s), keep_prefix, keep_suffix)
}

/// Splits substr-style arguments: `(text, start, end[, p1[, p2]])`.
fn substr_args<'s, 'a>(
    name: &str,
    args: &'s [Value<'a>],
) -> Result<(std::borrow::Cow<'a, str>, i64, i64, String, String), String> {
    if args.len() < 3 || args.len() > 5 {
        return Err(format!("{name}(): invalid number of arguments"));
    }
    let text = args[0].to_string_value();
    let (Some(Number::Int(s)), Some(Number::Int(e))) = (args[1].as_number(), args[2].as_number())
    else {
        return Err(format!("{name}(): indices must be integers"));
    };
    let p1 = args
        .get(3)
        .map(|v| v.to_string_value().into_owned())
        .unwrap_or_default();
    let p2 = args
        .get(4)
        .map(|v| v.to_string_value().into_owned())
        .unwrap_or_else(|| p1.clone());
    Ok((text, s, e, p1, p2))
}

/// Maps a code-point index range to a byte range.
fn char_range_to_bytes(text: &str, s: usize, e: usize) -> (usize, usize) {
    let mut byte_s = text.len();
    let mut byte_e = text.len();
    for (count, (byte, _)) in text.char_indices().enumerate() {
        if count == s {
            byte_s = byte;
        }
        if count == e {
            byte_e = byte;
            break;
        }
    }
    if s == 0 {
        byte_s = 0;
    }
    (byte_s, byte_e.max(byte_s))
}

/// `substr(str, start, end[, prefix[, suffix]])`: python-style slicing with
/// optional affixes marking clipped sides.
pub(super) fn substr<'a>(args: &[Value<'a>], ctx: &mut FunctionCtx<'_>) -> FunctionResult<'a> {
    let (text, s, e, p1, p2) = substr_args("substr", args)?;
    let length = if ctx.is_utf8() {
        text.chars().count()
    } else {
        text.len()
    };
    let (s, e, keep_prefix, keep_suffix) = substr_bounds(length, s, e);

    let piece = if s >= length || e <= s {
        ""
    } else if ctx.is_utf8() {
        let (bs, be) = char_range_to_bytes(&text, s, e);
        &text[bs..be]
    } else {
        &text[s..e]
    };

    let mut out = String::new();
    if keep_prefix {
        out.push_str(&p1);
    }
    out.push_str(piece);
    if keep_suffix {
        out.push_str(&p2);
    }
    Ok(Value::String(out))
}

/// `wordsubstr(str, start, end[, prefix[, suffix]])`: like `substr` but the
/// cut is widened to word boundaries and surrounding whitespace is dropped.
pub(super) fn wordsubstr<'a>(args: &[Value<'a>], ctx: &mut FunctionCtx<'_>) -> FunctionResult<'a> {
    let (text, s, e, p1, p2) = substr_args("wordsubstr", args)?;
    let bytes = text.as_bytes();
    let length = if ctx.is_utf8() {
        text.chars().count()
    } else {
        text.len()
    };
    let (s, e, _, _) = substr_bounds(length, s, e);
    if s >= length || e <= s {
        return Ok(Value::String(String::new()));
    }
    let (mut s, e) = if ctx.is_utf8() {
        char_range_to_bytes(&text, s, e)
    } else {
        (s, e)
    };
    let mut e = e - s;

    let is_ws = |b: u8| b.is_ascii_whitespace() || b == 0x0b;

    // widen to word boundaries
    if !is_ws(bytes[s + e - 1]) {
        while s + e < bytes.len() && !is_ws(bytes[s + e]) {
            e += 1;
        }
    }
    if !is_ws(bytes[s]) {
        while s > 0 && !is_ws(bytes[s - 1]) {
            s -= 1;
            e += 1;
        }
    }
    // trim whitespace inside the cut
    while e > 0 && is_ws(bytes[s + e - 1]) {
        e -= 1;
    }
    while e > 0 && is_ws(bytes[s]) {
        e -= 1;
        s += 1;
    }

    let start_white = bytes[..s].iter().all(|b| is_ws(*b));
    let end_white = bytes[s + e..].iter().all(|b| is_ws(*b));

    let mut out = String::new();
    if !start_white {
        out.push_str(&p1);
    }
    out.push_str(&text[s..s + e]);
    if !end_white {
        out.push_str(&p2);
    }
    Ok(Value::String(out))
}

/// `replace(str, from, to)`: replaces every occurrence.
pub(super) fn replace<'a>(args: &[Value<'a>], _: &mut FunctionCtx<'_>) -> FunctionResult<'a> {
    let [text, from, to] = args else {
        return Err("replace(): invalid number of arguments".to_owned());
    };
    let from = from.to_string_value();
    if from.is_empty() {
        return Ok(Value::String(text.to_string_value().into_owned()));
    }
    Ok(Value::String(
        text.to_string_value().replace(&*from, &to.to_string_value()),
    ))
}

/// `regex_replace(str, pattern, replacement)`: PCRE-style replacement with
/// `$1` capture references; a regex value controls its own `g` flag, a plain
/// string pattern replaces everywhere.
pub(super) fn regex_replace<'a>(args: &[Value<'a>], _: &mut FunctionCtx<'_>) -> FunctionResult<'a> {
    let [text, pattern, replacement] = args else {
        return Err("regex_replace(): invalid number of arguments".to_owned());
    };
    let text = text.to_string_value();
    let replacement = replacement.to_string_value();
    match pattern {
        Value::Regex(re) => Ok(Value::String(re.replace(&text, &replacement))),
        Value::String(_) | Value::StringRef(_) => {
            let source = pattern.as_str().expect("string-ish pattern");
            let re = RegexValue::new(
                source,
                RegexFlags {
                    global: true,
                    ..RegexFlags::default()
                },
            )
            .map_err(|err| format!("regex_replace(): {err}"))?;
            Ok(Value::String(re.replace(&text, &replacement)))
        }
        _ => Err("regex_replace(): pattern must be a regex or a string".to_owned()),
    }
}

/// `strtolower(str)`: Unicode lowercase.
pub(super) fn strtolower<'a>(args: &[Value<'a>], _: &mut FunctionCtx<'_>) -> FunctionResult<'a> {
    let [arg] = args else {
        return Err("strtolower(): invalid number of arguments".to_owned());
    };
    Ok(Value::String(arg.to_string_value().to_lowercase()))
}

/// `strtoupper(str)`: Unicode uppercase.
pub(super) fn strtoupper<'a>(args: &[Value<'a>], _: &mut FunctionCtx<'_>) -> FunctionResult<'a> {
    let [arg] = args else {
        return Err("strtoupper(): invalid number of arguments".to_owned());
    };
    Ok(Value::String(arg.to_string_value().to_uppercase()))
}

/// `nl2br(str)`: appends `<br />` after each newline.
pub(super) fn nl2br<'a>(args: &[Value<'a>], _: &mut FunctionCtx<'_>) -> FunctionResult<'a> {
    let [arg] = args else {
        return Err("nl2br(): invalid number of arguments".to_owned());
    };
    Ok(Value::String(
        arg.to_string_value().replace('\n', "\n<br />"),
    ))
}

/// `reorder(format, args...)`: rebuilds the format string replacing `%1` and
/// `%{12}` positional markers with the matching argument.
pub(super) fn reorder<'a>(args: &[Value<'a>], ctx: &mut FunctionCtx<'_>) -> FunctionResult<'a> {
    let Some((format, subs)) = args.split_first() else {
        return Err("reorder(): invalid number of arguments".to_owned());
    };
    let format = format.to_string_value();

    enum State {
        Default,
        /// Just behind `%`.
        Format,
        /// Inside `%{...}`.
        Number(usize),
    }

    let mut out = String::with_capacity(2 * format.len());
    let mut state = State::Default;
    let mut replace_index = None;
    let mut mark = 0usize;

    for (i, ch) in format.char_indices() {
        match (ch, &mut state) {
            ('%', State::Format) => {
                out.push('%');
                state = State::Default;
            }
            ('%', State::Default) => {
                state = State::Format;
                mark = i;
            }
            ('%', State::Number(_)) => {
                ctx.errors
                    .push("reorder(): '%' not allowed inside '%{}'.".to_owned());
                out.push_str(&format[mark..=i]);
                state = State::Default;
            }
            ('0'..='9', State::Format) => {
                replace_index = Some(ch as usize - '0' as usize);
                state = State::Default;
            }
            ('0'..='9', State::Number(n)) => {
                *n = *n * 10 + (ch as usize - '0' as usize);
            }
            ('{', State::Format) => state = State::Number(0),
            ('{', State::Number(_)) => {
                ctx.errors
                    .push("reorder(): '{' not allowed inside '%{}'.".to_owned());
                out.push_str(&format[mark..=i]);
                state = State::Default;
            }
            ('}', State::Number(n)) => {
                replace_index = Some(*n);
                state = State::Default;
            }
            ('}', State::Format) => {
                ctx.errors
                    .push("reorder(): '}' not allowed after '%'.".to_owned());
                out.push_str(&format[mark..=i]);
                state = State::Default;
            }
            (_, State::Default) => out.push(ch),
            (_, State::Format | State::Number(_)) => {
                ctx.errors.push(format!(
                    "reorder(): '{ch}' not allowed inside %{{}} or after %."
                ));
                out.push_str(&format[mark..=i]);
                state = State::Default;
            }
        }

        if let Some(index) = replace_index.take() {
            if index == 0 || index > subs.len() {
                ctx.errors.push(format!(
                    "reorder(): invalid or missing index in format '{}'.",
                    &format[mark..=i]
                ));
                out.push_str(&format[mark..=i]);
            } else {
                out.push_str(&subs[index - 1].to_string_value());
            }
        }
    }
    if !matches!(state, State::Default) {
        ctx.errors.push("reorder(): runaway argument.".to_owned());
        out.push_str(&format[mark..]);
    }

    Ok(Value::String(out))
}

/// Shared by tests: build a regex value argument.
#[cfg(test)]
pub(super) fn regex_arg(pattern: &str, flags: &str) -> Value<'static> {
    use std::sync::Arc;

    use crate::{error::ErrorLog, position::Position};
    let mut log = ErrorLog::new();
    let flags = RegexFlags::parse(flags, &Position::whole_file(None), &mut log);
    Value::Regex(Arc::new(RegexValue::new(pattern, flags).unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contenttype::{Escaper, default_descriptor};

    fn call<'a>(
        handler: super::super::Handler,
        args: &[Value<'a>],
        encoding: &str,
    ) -> FunctionResult<'a> {
        let escaper = Escaper::new(default_descriptor());
        let mut ctx = FunctionCtx::new(&escaper, encoding);
        handler(args, &mut ctx)
    }

    #[test]
    fn len_respects_encoding() {
        let args = [Value::String("žluť".to_owned())];
        assert!(matches!(call(len, &args, "utf-8"), Ok(Value::Int(4))));
        assert!(matches!(call(len, &args, "iso-8859-2"), Ok(Value::Int(6))));
    }

    #[test]
    fn substr_basic_and_negative() {
        let args = [
            Value::String("hello world".to_owned()),
            Value::Int(0),
            Value::Int(5),
        ];
        let Ok(Value::String(s)) = call(substr, &args, "utf-8") else {
            panic!()
        };
        assert_eq!(s, "hello");

        let args = [
            Value::String("hello world".to_owned()),
            Value::Int(-5),
            Value::Int(11),
        ];
        let Ok(Value::String(s)) = call(substr, &args, "utf-8") else {
            panic!()
        };
        assert_eq!(s, "world");
    }

    #[test]
    fn substr_affixes_only_on_clipped_sides() {
        let args = [
            Value::String("abcdef".to_owned()),
            Value::Int(1),
            Value::Int(3),
            Value::String("<".to_owned()),
            Value::String(">".to_owned()),
        ];
        let Ok(Value::String(s)) = call(substr, &args, "utf-8") else {
            panic!()
        };
        assert_eq!(s, "<bc>");

        let args = [
            Value::String("abc".to_owned()),
            Value::Int(0),
            Value::Int(3),
            Value::String("<".to_owned()),
            Value::String(">".to_owned()),
        ];
        let Ok(Value::String(s)) = call(substr, &args, "utf-8") else {
            panic!()
        };
        assert_eq!(s, "abc");
    }

    #[test]
    fn wordsubstr_widens_to_words() {
        let args = [
            Value::String("one two three".to_owned()),
            Value::Int(0),
            Value::Int(5),
        ];
        let Ok(Value::String(s)) = call(wordsubstr, &args, "utf-8") else {
            panic!()
        };
        assert_eq!(s, "one two");
    }

    #[test]
    fn replace_and_case() {
        let args = [
            Value::String("a-b-c".to_owned()),
            Value::String("-".to_owned()),
            Value::String("+".to_owned()),
        ];
        let Ok(Value::String(s)) = call(replace, &args, "utf-8") else {
            panic!()
        };
        assert_eq!(s, "a+b+c");

        let args = [Value::String("Žluť".to_owned())];
        let Ok(Value::String(s)) = call(strtolower, &args, "utf-8") else {
            panic!()
        };
        assert_eq!(s, "žluť");
    }

    #[test]
    fn regex_replace_with_captures() {
        let args = [
            Value::String("2023-12-31".to_owned()),
            regex_arg(r"(\d+)-(\d+)-(\d+)", ""),
            Value::String("$3.$2.$1".to_owned()),
        ];
        let Ok(Value::String(s)) = call(regex_replace, &args, "utf-8") else {
            panic!()
        };
        assert_eq!(s, "31.12.2023");
    }

    #[test]
    fn reorder_positional() {
        let args = [
            Value::String("%2-%1 and %{2}%%".to_owned()),
            Value::String("a".to_owned()),
            Value::String("b".to_owned()),
        ];
        let Ok(Value::String(s)) = call(reorder, &args, "utf-8") else {
            panic!()
        };
        assert_eq!(s, "b-a and b%");
    }

    #[test]
    fn reorder_bad_index_keeps_marker() {
        let escaper = Escaper::new(default_descriptor());
        let mut ctx = FunctionCtx::new(&escaper, "utf-8");
        let args = [Value::String("%7".to_owned())];
        let Ok(Value::String(s)) = reorder(&args, &mut ctx) else {
            panic!()
        };
        assert_eq!(s, "%7");
        assert!(!ctx.errors.is_empty());
    }

    #[test]
    fn nl2br_keeps_newline() {
        let args = [Value::String("a\nb".to_owned())];
        let Ok(Value::String(s)) = call(nl2br, &args, "utf-8") else {
            panic!()
        };
        assert_eq!(s, "a\n<br />b");
    }
}
