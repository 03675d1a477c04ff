//! Fragment iteration, nesting, locals and iteration builtins.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use teng::{ErrorLog, Fragment, GenPageArgs, InMemoryFilesystem, Level, StringWriter, Teng};

fn render(template: &str, data: &Fragment) -> (String, ErrorLog) {
    let engine = Teng::with_filesystem(Arc::new(InMemoryFilesystem::new()), "");
    let mut writer = StringWriter::new();
    let mut log = ErrorLog::new();
    let _ = engine.generate_page_string(
        template,
        &GenPageArgs::default(),
        data,
        &mut writer,
        &mut log,
    );
    (writer.into_output(), log)
}

fn items_data(names: &[&str]) -> Fragment {
    let mut data = Fragment::new();
    let items = data.add_fragment_list("items");
    for name in names {
        items.add_fragment().add_string("name", *name);
    }
    data
}

#[test]
fn iteration_builtins() {
    let data = items_data(&["a", "b", "c"]);
    let template = "<?teng frag items ?>${_index}/${_count}:${name}\
                    <?teng if _first ?>[first]<?teng endif ?>\
                    <?teng if _inner ?>[inner]<?teng endif ?>\
                    <?teng if _last ?>[last]<?teng endif ?>;<?teng endfrag ?>";
    let (output, log) = render(template, &data);
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "0/3:a[first];1/3:b[inner];2/3:c[last];");
}

#[test]
fn nested_fragments() {
    let mut data = Fragment::new();
    let rows = data.add_fragment_list("rows");
    for row in ["x", "y"] {
        let fragment = rows.add_fragment();
        fragment.add_string("row", row);
        let cells = fragment.add_fragment_list("cells");
        for cell in ["1", "2"] {
            cells.add_fragment().add_string("cell", cell);
        }
    }

    let template = "<?teng frag rows ?>${row}:<?teng frag cells ?>${cell}\
                    <?teng endfrag ?>|<?teng endfrag ?>";
    let (output, log) = render(template, &data);
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "x:12|y:12|");
}

#[test]
fn dotted_fragment_path_opens_each_segment() {
    let mut data = Fragment::new();
    let outer = data.add_fragment("outer");
    outer.add_fragment("inner").add_string("v", "deep");

    let (output, log) = render(
        "<?teng frag outer.inner ?>${v}<?teng endfrag ?>",
        &data,
    );
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "deep");
}

#[test]
fn plain_names_resolve_in_the_current_fragment_only() {
    let mut data = items_data(&["a"]);
    data.add_string("site", "teng");

    // `site` lives on the root, not on the open item; the reference warns
    // and renders as nothing
    let (output, log) = render(
        "<?teng frag items ?>${site}/${name}<?teng endfrag ?>",
        &data,
    );
    assert_eq!(output, "/a");
    assert_eq!(log.max_level(), Some(Level::Warning));
}

#[test]
fn absolute_paths_reach_the_root() {
    let mut data = items_data(&["a"]);
    data.add_string("site", "teng");

    let (output, log) = render(
        "<?teng frag items ?>${.site}<?teng endfrag ?>",
        &data,
    );
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "teng");
}

#[test]
fn reopening_an_outer_fragment_keeps_iteration_state() {
    let mut data = Fragment::new();
    let letters = data.add_fragment_list("letters");
    letters.add_fragment().add_string("l", "A");
    letters.add_fragment().add_string("l", "B");
    let digits = data.add_fragment_list("digits");
    digits.add_fragment().add_string("d", "1");
    digits.add_fragment().add_string("d", "2");

    // inside letters, iterate digits from the root again
    let template = "<?teng frag letters ?>${l}(<?teng frag .digits ?>${d}\
                    <?teng endfrag ?>)<?teng endfrag ?>";
    let (output, log) = render(template, &data);
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "A(12)B(12)");
}

#[test]
fn set_creates_locals_per_iteration() {
    let data = items_data(&["a", "b"]);
    let template = "<?teng frag items ?><?teng set seen = name ?>${seen}\
                    <?teng endfrag ?>";
    let (output, log) = render(template, &data);
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "ab");
}

#[test]
fn set_cannot_shadow_application_data() {
    let data = items_data(&["a"]);
    let template = "<?teng frag items ?><?teng set name = \"other\" ?>${name}\
                    <?teng endfrag ?>";
    let (output, log) = render(template, &data);
    assert_eq!(output, "a");
    assert_eq!(log.max_level(), Some(Level::Error));
}

#[test]
fn this_and_parent_navigation() {
    let mut data = items_data(&["a"]);
    data.add_string("site", "teng");

    let (output, log) = render(
        "<?teng frag items ?>${_this.name}/${_parent.site}<?teng endfrag ?>",
        &data,
    );
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "a/teng");
}

#[test]
fn count_of_unopened_fragment() {
    let data = items_data(&["a", "b", "c"]);
    let (output, log) = render("${items._count}", &data);
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "3");
}

#[test]
fn exists_isempty_and_count_queries() {
    let mut data = items_data(&["a"]);
    data.add_string("empty", "");

    assert_eq!(render("${exists(items)}", &data).0, "1");
    assert_eq!(render("${exists(nothing)}", &data).0, "0");
    assert_eq!(render("${isempty(empty)}", &data).0, "1");
    assert_eq!(render("${isempty(items)}", &data).0, "0");
    assert_eq!(render("${count(items)}", &data).0, "1");
}

#[test]
fn defined_is_deprecated() {
    let data = items_data(&["a"]);
    let (output, log) = render("${defined(items)}", &data);
    assert_eq!(output, "0");
    assert!(log.entries().iter().any(|e| e.msg.contains("deprecated")));
}

#[test]
fn jsonify_and_type_queries() {
    let data = items_data(&["a"]);
    let (output, log) = render("${jsonify(items)}", &data);
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, r#"[{"name":"a"}]"#);

    assert_eq!(render("${type(1)}", &data).0, "integral");
    assert_eq!(render(r#"${type("x")}"#, &data).0, "string");
}

#[test]
fn single_element_list_promotes_to_fragment() {
    let mut data = Fragment::new();
    let list = data.add_fragment_list("a");
    list.add_fragment().add_string("b", "deep");

    let (output, log) = render("${a.b}", &data);
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "deep");
}

#[test]
fn repeatfrag_renders_trees_recursively() {
    let mut data = Fragment::new();
    let nodes = data.add_fragment_list("node");
    let a = nodes.add_fragment();
    a.add_string("name", "a");
    let children = a.add_fragment_list("node");
    children.add_fragment().add_string("name", "a1");
    let a2 = children.add_fragment();
    a2.add_string("name", "a2");
    a2.add_fragment("node").add_string("name", "a2x");
    nodes.add_fragment().add_string("name", "b");

    let template = "<?teng frag node ?>(${name}<?teng repeatfrag node ?>)<?teng endfrag ?>";
    let (output, log) = render(template, &data);
    assert!(log.is_empty(), "{log}");
    assert_eq!(output, "(a(a1)(a2(a2x)))(b)");
}

#[test]
fn repeatfrag_outside_its_fragment_is_an_error() {
    let (output, log) = render("<?teng repeatfrag node ?>x", &Fragment::new());
    assert_eq!(output, "x");
    assert!(log.entries().iter().any(|e| e.msg.contains("repeat")));
}

#[test]
fn unclosed_fragment_is_reported_and_still_renders() {
    let data = items_data(&["a"]);
    let (output, log) = render("<?teng frag items ?>${name}", &data);
    assert_eq!(output, "a");
    assert!(log.entries().iter().any(|e| e.msg.contains("endfrag")));
}
