//! End-to-end rendering scenarios.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use teng::{ErrorLog, Fragment, GenPageArgs, InMemoryFilesystem, Level, StringWriter, Teng};

const COMMON_HEAD: &str =
    "\t<head>\n\t\t<title>Example page: ${title}</title>\n\t</head>";

fn engine_with(files: &[(&str, &str)]) -> Teng {
    let fs = Arc::new(InMemoryFilesystem::new());
    for (path, content) in files {
        fs.put(*path, *content);
    }
    Teng::with_filesystem(fs, "")
}

fn render(engine: &Teng, template: &str, data: &Fragment) -> (String, ErrorLog) {
    let mut writer = StringWriter::new();
    let mut log = ErrorLog::new();
    let args = GenPageArgs {
        content_type: "text/html",
        encoding: "utf-8",
        ..GenPageArgs::default()
    };
    let _ = engine.generate_page_string(template, &args, data, &mut writer, &mut log);
    (writer.into_output(), log)
}

#[test]
fn include_substitutes_variables() {
    let engine = engine_with(&[("common-head.html", COMMON_HEAD)]);
    let mut data = Fragment::new();
    data.add_string("title", "Title");

    let (output, log) = render(
        &engine,
        "<?teng include file=\"common-head.html\" ?>",
        &data,
    );
    assert!(log.is_empty(), "{log}");
    assert_eq!(
        output,
        "\t<head>\n\t\t<title>Example page: Title</title>\n\t</head>"
    );
}

#[test]
fn undefined_variable_warns_at_include_position() {
    let engine = engine_with(&[("common-head.html", COMMON_HEAD)]);
    let data = Fragment::new();

    let (output, log) = render(
        &engine,
        "<?teng include file=\"common-head.html\" ?>",
        &data,
    );
    assert_eq!(
        output,
        "\t<head>\n\t\t<title>Example page: </title>\n\t</head>"
    );

    let entries = log.entries();
    assert_eq!(entries.len(), 1, "{log}");
    let warning = &entries[0];
    assert_eq!(warning.level, Level::Warning);
    assert!(warning.msg.contains("Variable '.title' is undefined"));
    assert_eq!(warning.pos.filename_str(), "common-head.html");
    assert_eq!((warning.pos.line, warning.pos.column), (2, 37));
}

#[test]
fn nested_includes_concatenate() {
    let engine = engine_with(&[
        (
            "page.html",
            "<?teng include file=\"common-head.html\" ?>\n<body>\n\
             <?teng include file=\"subdir/paragraph.html\" ?>\n</body>",
        ),
        ("common-head.html", COMMON_HEAD),
        ("subdir/paragraph.html", "<p>${title}</p>"),
    ]);
    let mut data = Fragment::new();
    data.add_string("title", "Title");

    let (output, log) = render(&engine, "<?teng include file=\"page.html\" ?>", &data);
    assert!(log.is_empty(), "{log}");
    assert_eq!(
        output,
        "\t<head>\n\t\t<title>Example page: Title</title>\n\t</head>\n<body>\n<p>Title</p>\n</body>"
    );
}

#[test]
fn fragment_iteration() {
    let engine = engine_with(&[]);
    let mut data = Fragment::new();
    let items = data.add_fragment_list("items");
    for name in ["a", "b", "c"] {
        items.add_fragment().add_string("name", name);
    }

    let (output, log) = render(
        &engine,
        "<?teng frag items ?>${name},<?teng endfrag ?>",
        &data,
    );
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "a,b,c,");
}

#[test]
fn empty_and_missing_fragments_render_nothing() {
    let engine = engine_with(&[]);
    let template = "<?teng frag items ?>${name},<?teng endfrag ?>";

    let mut data = Fragment::new();
    data.add_fragment_list("items");
    let (output, log) = render(&engine, template, &data);
    assert_eq!(output, "");
    assert!(log.is_empty(), "{log}");

    let (output, log) = render(&engine, template, &Fragment::new());
    assert_eq!(output, "");
    assert!(log.is_empty(), "{log}");
}

#[test]
fn html_escaping_and_unescape_peephole() {
    let engine = engine_with(&[]);
    let mut data = Fragment::new();
    data.add_string("x", "<a>");

    let (output, log) = render(&engine, "${x}", &data);
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "&lt;a&gt;");

    let (output, log) = render(&engine, "${unescape(x)}", &data);
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "<a>");
}

#[test]
fn text_escape_digraphs() {
    let engine = engine_with(&[]);
    let (output, log) = render(&engine, r"price: $\{x} #\{y} \}", &Fragment::new());
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "price: ${x} #{y} }");
}

#[test]
fn comments_vanish() {
    let engine = engine_with(&[]);
    let (output, log) = render(&engine, "a<!--- note --->b", &Fragment::new());
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "ab");
}

#[test]
fn unterminated_directive_is_fatal_but_keeps_output() {
    let engine = engine_with(&[]);
    let mut writer = StringWriter::new();
    let mut log = ErrorLog::new();
    let result = engine.generate_page_string(
        "before${x",
        &GenPageArgs::default(),
        &Fragment::new(),
        &mut writer,
        &mut log,
    );
    assert!(result.is_err());
    assert_eq!(log.max_level(), Some(Level::Fatal));
    assert_eq!(writer.output(), "before");
}
