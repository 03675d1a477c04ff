//! The builtin function library exercised through templates, plus
//! user-defined functions.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use teng::{
    ErrorLog, Fragment, GenPageArgs, InMemoryFilesystem, StringWriter, Teng, Value,
};

fn render(template: &str, data: &Fragment) -> (String, ErrorLog) {
    let engine = Teng::with_filesystem(Arc::new(InMemoryFilesystem::new()), "");
    let mut writer = StringWriter::new();
    let mut log = ErrorLog::new();
    let args = GenPageArgs {
        encoding: "utf-8",
        ..GenPageArgs::default()
    };
    let _ = engine.generate_page_string(template, &args, data, &mut writer, &mut log);
    (writer.into_output(), log)
}

fn render_ok(template: &str) -> String {
    let (output, log) = render(template, &Fragment::new());
    assert!(log.is_empty(), "{log}");
    output
}

#[test]
fn string_functions() {
    assert_eq!(render_ok(r#"${len("hello")}"#), "5");
    assert_eq!(render_ok(r#"${len("žluť")}"#), "4");
    assert_eq!(render_ok(r#"${substr("hello world", 0, 5)}"#), "hello");
    assert_eq!(render_ok(r#"${substr("hello world", 6, 11)}"#), "world");
    assert_eq!(render_ok(r#"${substr("abcdef", 1, 3, "<", ">")}"#), "<bc>");
    assert_eq!(render_ok(r#"${wordsubstr("one two three", 0, 5)}"#), "one two");
    assert_eq!(render_ok(r#"${replace("a-b", "-", "+")}"#), "a+b");
    assert_eq!(render_ok(r#"${strtolower("ABC")}"#), "abc");
    assert_eq!(render_ok(r#"${strtoupper("abc")}"#), "ABC");
    assert_eq!(render_ok(r#"${nl2br("a\nb")}"#), "a\n<br />b");
    assert_eq!(render_ok(r#"${reorder("%2+%1", "a", "b")}"#), "b+a");
}

#[test]
fn numeric_functions() {
    assert_eq!(render_ok("${round(1234.56789, 2)}"), "1234.57");
    assert_eq!(render_ok("${round(1234, -2)}"), "1200");
    assert_eq!(render_ok("${int(2.9)}"), "2");
    assert_eq!(render_ok(r#"${int("42")}"#), "42");
    assert_eq!(render_ok("${isnumber(1)}"), "1");
    assert_eq!(render_ok(r#"${isnumber("1")}"#), "0");
    assert_eq!(
        render_ok(r#"${numformat(1234567.891, 2, ",", " ")}"#),
        "1 234 567,89"
    );
}

#[test]
fn date_functions() {
    assert_eq!(
        render_ok(r#"${date("%d.%m.%Y", "2023-12-31")}"#),
        "31.12.2023"
    );
    assert_eq!(render_ok("${sectotime(3661)}"), "1:01:01");
    // now() is impure, so it must not be folded away; it yields an epoch real
    let output = render_ok("${now() > 1000000000}");
    assert_eq!(output, "1");
}

#[test]
fn random_stays_in_range() {
    for _ in 0..16 {
        let output = render_ok("${random(10)}");
        let value: i64 = output.parse().expect("integer output");
        assert!((0..10).contains(&value));
    }
}

#[test]
fn escape_functions() {
    assert_eq!(render_ok(r#"${urlescape("a b/c?")}"#), "a%20b/c%3F");
    // escape() uses the active content type; text/plain leaves all alone
    assert_eq!(render_ok(r#"${escape("<a>")}"#), "<a>");
}

#[test]
fn regex_replace_function() {
    assert_eq!(
        render_ok(r#"${regex_replace("2023-12-31", "(\d+)-(\d+)-(\d+)", "$3.$2.$1")}"#),
        "31.12.2023"
    );
}

#[test]
fn function_error_yields_undefined_string() {
    let (output, log) = render("${round(1)}", &Fragment::new());
    assert_eq!(output, "undefined");
    assert!(!log.is_empty());

    let (output, log) = render(r#"${int("many")}"#, &Fragment::new());
    assert_eq!(output, "undefined");
    assert!(log.entries().iter().any(|e| e.msg.contains("Cannot convert")));
}

#[test]
fn deprecated_aliases_work() {
    assert_eq!(render_ok("${sec_to_time(60)}"), "0:01:00");
    assert_eq!(render_ok(r#"${substr_word("one two", 0, 2)}"#), "one");
}

#[test]
fn user_defined_functions() {
    let mut engine = Teng::with_filesystem(Arc::new(InMemoryFilesystem::new()), "");
    engine.udf_registry_mut().register("twice", |args| {
        let [value] = args else {
            return Err("expected one argument".to_owned());
        };
        match value.as_int() {
            Some(v) => Ok(Value::Int(v * 2)),
            None => Err("expected a number".to_owned()),
        }
    });

    let mut writer = StringWriter::new();
    let mut log = ErrorLog::new();
    engine
        .generate_page_string(
            "${twice(21)}",
            &GenPageArgs::default(),
            &Fragment::new(),
            &mut writer,
            &mut log,
        )
        .unwrap();
    assert!(log.is_empty(), "{log}");
    assert_eq!(writer.output(), "42");

    // argument errors are logged with the function name
    let mut writer = StringWriter::new();
    let mut log = ErrorLog::new();
    let _ = engine.generate_page_string(
        r#"${twice("many")}"#,
        &GenPageArgs::default(),
        &Fragment::new(),
        &mut writer,
        &mut log,
    );
    assert_eq!(writer.output(), "undefined");
    assert!(log.entries().iter().any(|e| e.msg.contains("twice()")));
}

#[test]
fn byte_encoding_changes_len_semantics() {
    let engine = Teng::with_filesystem(Arc::new(InMemoryFilesystem::new()), "");
    let mut writer = StringWriter::new();
    let mut log = ErrorLog::new();
    let args = GenPageArgs {
        encoding: "iso-8859-2",
        ..GenPageArgs::default()
    };
    engine
        .generate_page_string(r#"${len("žluť")}"#, &args, &Fragment::new(), &mut writer, &mut log)
        .unwrap();
    assert_eq!(writer.output(), "6");
}
