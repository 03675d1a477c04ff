//! Conditionals, formatting, content types and configuration-driven
//! directives.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use teng::{ErrorLog, Fragment, GenPageArgs, InMemoryFilesystem, Level, StringWriter, Teng};

fn render_files(
    files: &[(&str, &str)],
    template: &str,
    config: &str,
    data: &Fragment,
) -> (String, ErrorLog) {
    let fs = Arc::new(InMemoryFilesystem::new());
    for (path, content) in files {
        fs.put(*path, *content);
    }
    let engine = Teng::with_filesystem(fs, "");
    let mut writer = StringWriter::new();
    let mut log = ErrorLog::new();
    let args = GenPageArgs {
        config,
        content_type: "text/html",
        encoding: "utf-8",
        ..GenPageArgs::default()
    };
    let _ = engine.generate_page_string(template, &args, data, &mut writer, &mut log);
    (writer.into_output(), log)
}

fn render(template: &str, data: &Fragment) -> (String, ErrorLog) {
    render_files(&[], template, "", data)
}

#[test]
fn if_elif_else_chain() {
    let mut data = Fragment::new();
    data.add_int("n", 2);
    let template = "<?teng if n == 1 ?>one<?teng elif n == 2 ?>two\
                    <?teng else ?>many<?teng endif ?>";
    let (output, log) = render(template, &data);
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "two");

    let mut data = Fragment::new();
    data.add_int("n", 9);
    assert_eq!(render(template, &data).0, "many");

    let mut data = Fragment::new();
    data.add_int("n", 1);
    assert_eq!(render(template, &data).0, "one");
}

#[test]
fn elseif_spelling() {
    let mut data = Fragment::new();
    data.add_int("n", 2);
    let template = "<?teng if n == 1 ?>one<?teng elseif n == 2 ?>two<?teng endif ?>";
    assert_eq!(render(template, &data).0, "two");
}

#[test]
fn format_directive_nowhite() {
    let (output, log) = render(
        "a<?teng format space=\"nowhite\" ?>  b  c  <?teng endformat ?> d",
        &Fragment::new(),
    );
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "abc d");
}

#[test]
fn format_directive_onespace_nests() {
    let template = "<?teng format space=\"onespace\" ?>a  b\
                    <?teng format space=\"nowhite\" ?> c d\
                    <?teng endformat ?> e<?teng endformat ?>";
    let (output, log) = render(template, &Fragment::new());
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "a bcd e");
}

#[test]
fn unknown_format_mode_is_reported() {
    let (output, log) = render(
        "<?teng format space=\"wild\" ?>x<?teng endformat ?>",
        &Fragment::new(),
    );
    assert_eq!(output, "x");
    assert!(log.entries().iter().any(|e| e.msg.contains("wild")));
}

#[test]
fn format_feature_disable_passes_whitespace() {
    let (output, log) = render_files(
        &[("cfg", "%disable format\n")],
        "<?teng format space=\"nowhite\" ?>a  b<?teng endformat ?>",
        "cfg",
        &Fragment::new(),
    );
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "a  b");
}

#[test]
fn ctype_switches_escaping() {
    let mut data = Fragment::new();
    data.add_string("x", "a\"b");
    // inside the quoted-string region, quotes get backslash escapes instead
    // of html entities
    let template = "${x}|<?teng ctype \"quoted-string\" ?>${x}<?teng endctype ?>";
    let (output, log) = render(template, &data);
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "a&quot;b|a\\\"b");
}

#[test]
fn unknown_ctype_falls_back_to_plain() {
    let mut data = Fragment::new();
    data.add_string("x", "<a>");
    let template = "<?teng ctype \"no/such\" ?>${x}<?teng endctype ?>";
    let (output, log) = render(template, &data);
    assert_eq!(output, "<a>");
    assert!(log.entries().iter().any(|e| e.msg.contains("not found")));
}

#[test]
fn short_tag_requires_config() {
    let mut data = Fragment::new();
    data.add_int("n", 1);
    let template = "<? if n ?>yes<? endif ?>";

    // disabled by default: short tags are plain text
    let (output, _) = render(template, &data);
    assert_eq!(output, "<? if n ?>yes<? endif ?>");

    let (output, log) = render_files(
        &[("cfg", "%enable shorttag\n")],
        template,
        "cfg",
        &data,
    );
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "yes");
}

#[test]
fn alwaysescape_disable_prints_raw() {
    let mut data = Fragment::new();
    data.add_string("x", "<a>");
    let (output, log) = render_files(
        &[("cfg", "%disable alwaysescape\n")],
        "${x}",
        "cfg",
        &data,
    );
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "<a>");
}

#[test]
fn bytecode_directive_dumps_program() {
    let (output, log) = render_files(
        &[("cfg", "%enable bytecode\n")],
        "<?teng bytecode ?>${1+1}",
        "cfg",
        &Fragment::new(),
    );
    assert!(log.is_empty(), "{log}");
    assert!(output.contains("HALT"), "{output}");
    assert!(output.ends_with('2'), "{output}");
}

#[test]
fn bytecode_directive_is_noop_without_flag() {
    let (output, log) = render("<?teng bytecode ?>x", &Fragment::new());
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "x");
}

#[test]
fn debug_directive_dumps_data() {
    let mut data = Fragment::new();
    data.add_string("title", "a very long title that should be clipped by the dump");
    let (output, log) = render_files(
        &[("cfg", "%enable debug\n%maxdebugvallength 10\n")],
        "<?teng debug ?>",
        "cfg",
        &data,
    );
    assert!(log.is_empty(), "{log}");
    assert!(output.contains("Application data:"), "{output}");
    assert!(output.contains("title: 'a very ...'"), "{output}");
}

#[test]
fn logtooutput_appends_log() {
    let (output, _) = render_files(
        &[("cfg", "%enable logtooutput\n")],
        "${missing}",
        "cfg",
        &Fragment::new(),
    );
    assert!(output.contains("Variable '.missing' is undefined"), "{output}");
}

#[test]
fn unbalanced_endif_is_reported() {
    let (output, log) = render("a<?teng endif ?>b", &Fragment::new());
    assert_eq!(output, "ab");
    assert!(log.entries().iter().any(|e| e.msg.contains("endif")));
    assert_eq!(log.max_level(), Some(Level::Error));
}

#[test]
fn unknown_directive_is_reported() {
    let (output, log) = render("<?teng warp ?>x", &Fragment::new());
    assert_eq!(output, "x");
    assert!(log.entries().iter().any(|e| e.msg.contains("'warp'")));
}

#[test]
fn include_depth_is_limited() {
    let (_, log) = render_files(
        &[("self.html", "<?teng include file=\"self.html\" ?>")],
        "<?teng include file=\"self.html\" ?>",
        "",
        &Fragment::new(),
    );
    assert!(
        log.entries().iter().any(|e| e.msg.contains("cycle")),
        "{log}"
    );
}
