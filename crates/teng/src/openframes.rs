//! Runtime stack of open fragments.
//!
//! `<?teng frag?>` descends into the data tree; each descent is an
//! open-fragment record in the current frame. Opening a fragment that is not
//! reachable from the current top (an absolute path while something else is
//! open) pushes a whole new frame rooted at the data root, so the outer
//! iteration state survives until the matching close.
//!
//! The same interface drives the compile-time constant folder: its stub
//! implementation answers `NeedsRuntime` for everything that would require
//! real application data, which aborts folding without aborting compilation.

use ahash::AHashMap;

use crate::{
    bytecode::Identifier,
    fragment::{Fragment, FragmentValue},
    value::Value,
};

/// Position of an open fragment inside its list.
#[derive(Debug, Clone, Copy)]
pub struct ListPos {
    pub index: usize,
    pub size: usize,
    pub valid: bool,
}

/// Failure of a frame operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The compile-time stub cannot answer without application data.
    NeedsRuntime,
    /// Instruction offsets do not match the runtime stacks.
    BadOffsets,
}

type FrameResult<T> = Result<T, FrameError>;

/// Attribute of a fragment as a borrowed value.
fn get_attr<'a>(frag: Option<&'a Fragment>, name: &str) -> Value<'a> {
    match frag.and_then(|f| f.get(name)) {
        Some(value) => Value::from_fragment_value(value),
        None => Value::Undefined,
    }
}

/// The fragment a record's value currently designates.
fn get_frag<'a>(value: &Value<'a>) -> Option<&'a Fragment> {
    match value {
        Value::FragRef(frag) => Some(frag),
        Value::ListRef(list_ref) => list_ref
            .list
            .get(list_ref.index)
            .and_then(FragmentValue::fragment),
        _ => None,
    }
}


/// Python-style negative index fixup.
fn fix_negative_index(i: i64, len: usize) -> usize {
    if i >= 0 {
        i as usize
    } else if (-i) as usize > len {
        len
    } else {
        len - (-i) as usize
    }
}

/// i-th item of a list value.
fn get_value_at<'a>(value: &Value<'a>, i: i64) -> Value<'a> {
    match value {
        Value::ListRef(list_ref) => {
            let i = fix_negative_index(i, list_ref.list.len());
            match list_ref.list.get(i) {
                Some(item) => Value::from_fragment_value(item),
                None => Value::Undefined,
            }
        }
        _ => Value::Undefined,
    }
}

/// One open-fragment record: the designated value, `set` locals, and the
/// segment name for diagnostics.
#[derive(Debug)]
struct FragRecord<'a> {
    value: Value<'a>,
    locals: AHashMap<String, Value<'a>>,
    name: String,
}

/// One frame: the chain of open records along a single path.
#[derive(Debug)]
struct FrameRec<'a> {
    records: Vec<FragRecord<'a>>,
}

impl<'a> FrameRec<'a> {
    fn new(root: &'a Fragment) -> Self {
        Self {
            records: vec![FragRecord {
                value: Value::FragRef(root),
                locals: AHashMap::new(),
                name: String::new(),
            }],
        }
    }

    fn open_frag(&mut self, name: &str) -> bool {
        let top = self.records.last().expect("frame never empty");
        let child = get_attr(get_frag(&top.value), name);
        let open = match &child {
            Value::FragRef(_) => true,
            Value::ListRef(list_ref) => !list_ref.list.is_empty(),
            _ => false,
        };
        if open {
            self.records.push(FragRecord {
                value: child,
                locals: AHashMap::new(),
                name: name.to_owned(),
            });
        }
        open
    }

    fn next_frag(&mut self) -> bool {
        let top = self.records.last_mut().expect("frame never empty");
        if let Value::ListRef(list_ref) = &mut top.value
            && list_ref.index + 1 < list_ref.list.len()
        {
            list_ref.index += 1;
            // locals do not survive into the next iteration
            top.locals.clear();
            return true;
        }
        self.records.pop();
        false
    }

    fn record(&self, frag_offset: u16) -> FrameResult<&FragRecord<'a>> {
        let len = self.records.len();
        if usize::from(frag_offset) >= len {
            return Err(FrameError::BadOffsets);
        }
        Ok(&self.records[len - 1 - usize::from(frag_offset)])
    }

    fn record_mut(&mut self, frag_offset: u16) -> FrameResult<&mut FragRecord<'a>> {
        let len = self.records.len();
        if usize::from(frag_offset) >= len {
            return Err(FrameError::BadOffsets);
        }
        Ok(&mut self.records[len - 1 - usize::from(frag_offset)])
    }

    fn get_var(&self, frag_offset: u16, name: &str) -> FrameResult<Value<'a>> {
        let record = self.record(frag_offset)?;
        if let Some(local) = record.locals.get(name) {
            return Ok(local.clone());
        }
        Ok(get_attr(get_frag(&record.value), name))
    }

    fn set_var(&mut self, frag_offset: u16, name: &str, value: Value<'a>) -> FrameResult<bool> {
        let record = self.record(frag_offset)?;
        if !get_attr(get_frag(&record.value), name).is_undefined() {
            return Ok(false);
        }
        let record = self.record_mut(frag_offset)?;
        record.locals.insert(name.to_owned(), value);
        Ok(true)
    }

    fn list_pos(&self, frag_offset: u16) -> FrameResult<ListPos> {
        let len = self.records.len();
        if usize::from(frag_offset) >= len {
            return Err(FrameError::BadOffsets);
        }
        let i = len - 1 - usize::from(frag_offset);
        if i == 0 {
            // the root fragment behaves as a list of one
            return Ok(ListPos {
                index: 0,
                size: 1,
                valid: true,
            });
        }
        Ok(match &self.records[i].value {
            Value::ListRef(list_ref) => ListPos {
                index: list_ref.index,
                size: list_ref.list.len(),
                valid: true,
            },
            _ => ListPos {
                index: 0,
                size: 0,
                valid: false,
            },
        })
    }
}

/// Interface the interpreter uses to reach fragment data.
///
/// Implemented by the real [`OpenFrames`] and by [`ConstFrames`], the
/// compile-time stub used for expression folding.
pub trait FramesApi<'a> {
    fn open_frame(&mut self) -> FrameResult<()>;
    fn close_frame(&mut self) -> FrameResult<()>;
    fn open_frag(&mut self, name: &str) -> FrameResult<bool>;
    fn next_frag(&mut self) -> FrameResult<bool>;
    fn get_var(&self, ident: &Identifier) -> FrameResult<Value<'a>>;
    fn set_var(&mut self, ident: &Identifier, value: Value<'a>) -> FrameResult<bool>;
    fn list_pos(&self, ident: &Identifier) -> FrameResult<ListPos>;
    /// Value of the record at the given offsets (`_this`, `_parent`).
    fn frag(&self, frame_offset: u16, frag_offset: u16) -> FrameResult<Value<'a>>;
    /// Attribute access through a value, with lone-list promotion.
    fn frag_attr(&self, value: &Value<'a>, name: &str) -> FrameResult<Value<'a>>;
    /// Index or keyed access (`[]`).
    fn value_at(&self, value: &Value<'a>, index: &Value<'a>) -> FrameResult<Value<'a>>;
    /// Number of open records in the top frame; drives recursive fragment
    /// repetition.
    fn top_depth(&self) -> usize;
    /// The data root, for debug dumps.
    fn root(&self) -> Option<&'a Fragment>;
}

/// The real frame stack over application data.
#[derive(Debug)]
pub struct OpenFrames<'a> {
    root: &'a Fragment,
    frames: Vec<FrameRec<'a>>,
}

impl<'a> OpenFrames<'a> {
    #[must_use]
    pub fn new(root: &'a Fragment) -> Self {
        Self {
            root,
            frames: vec![FrameRec::new(root)],
        }
    }

    /// Depth of the frame stack; 1 when only the base frame is open.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Number of open records in the top frame, including the root record.
    #[must_use]
    pub fn top_depth(&self) -> usize {
        self.frames.last().map_or(0, |f| f.records.len())
    }

    fn frame(&self, frame_offset: u16) -> FrameResult<&FrameRec<'a>> {
        let len = self.frames.len();
        if usize::from(frame_offset) >= len {
            return Err(FrameError::BadOffsets);
        }
        Ok(&self.frames[len - 1 - usize::from(frame_offset)])
    }

    fn frame_mut(&mut self, frame_offset: u16) -> FrameResult<&mut FrameRec<'a>> {
        let len = self.frames.len();
        if usize::from(frame_offset) >= len {
            return Err(FrameError::BadOffsets);
        }
        Ok(&mut self.frames[len - 1 - usize::from(frame_offset)])
    }

    fn offsets(ident: &Identifier) -> FrameResult<(u16, u16)> {
        ident.offsets.ok_or(FrameError::BadOffsets)
    }
}

impl<'a> FramesApi<'a> for OpenFrames<'a> {
    fn open_frame(&mut self) -> FrameResult<()> {
        self.frames.push(FrameRec::new(self.root));
        Ok(())
    }

    fn close_frame(&mut self) -> FrameResult<()> {
        if self.frames.len() <= 1 {
            return Err(FrameError::BadOffsets);
        }
        self.frames.pop();
        Ok(())
    }

    fn open_frag(&mut self, name: &str) -> FrameResult<bool> {
        Ok(self.frames.last_mut().expect("frame stack never empty").open_frag(name))
    }

    fn next_frag(&mut self) -> FrameResult<bool> {
        Ok(self.frames.last_mut().expect("frame stack never empty").next_frag())
    }

    fn get_var(&self, ident: &Identifier) -> FrameResult<Value<'a>> {
        let (frame_offset, frag_offset) = Self::offsets(ident)?;
        self.frame(frame_offset)?.get_var(frag_offset, ident.name())
    }

    fn set_var(&mut self, ident: &Identifier, value: Value<'a>) -> FrameResult<bool> {
        let (frame_offset, frag_offset) = Self::offsets(ident)?;
        self.frame_mut(frame_offset)?
            .set_var(frag_offset, ident.name(), value)
    }

    fn list_pos(&self, ident: &Identifier) -> FrameResult<ListPos> {
        let (frame_offset, frag_offset) = Self::offsets(ident)?;
        self.frame(frame_offset)?.list_pos(frag_offset)
    }

    fn frag(&self, frame_offset: u16, frag_offset: u16) -> FrameResult<Value<'a>> {
        Ok(self.frame(frame_offset)?.record(frag_offset)?.value.clone())
    }

    fn frag_attr(&self, value: &Value<'a>, name: &str) -> FrameResult<Value<'a>> {
        // a list designates its item at the current index (0 for a list that
        // is not being iterated), which also covers the one-element-list
        // promotion behind `frag.a.b`
        Ok(get_attr(get_frag(value), name))
    }

    fn value_at(&self, value: &Value<'a>, index: &Value<'a>) -> FrameResult<Value<'a>> {
        Ok(match index {
            Value::Int(i) => get_value_at(value, *i),
            Value::Real(r) => get_value_at(value, *r as i64),
            Value::String(_) | Value::StringRef(_) => {
                let name = index.as_str().expect("string-ish index");
                get_attr(get_frag(value), name)
            }
            _ => Value::Undefined,
        })
    }

    fn top_depth(&self) -> usize {
        self.frames.last().map_or(0, |f| f.records.len())
    }

    fn root(&self) -> Option<&'a Fragment> {
        Some(self.root)
    }
}

/// Compile-time stub: every data access needs runtime.
#[derive(Debug, Default)]
pub struct ConstFrames;

impl FramesApi<'static> for ConstFrames {
    fn open_frame(&mut self) -> FrameResult<()> {
        Err(FrameError::NeedsRuntime)
    }

    fn close_frame(&mut self) -> FrameResult<()> {
        Err(FrameError::NeedsRuntime)
    }

    fn open_frag(&mut self, _: &str) -> FrameResult<bool> {
        Err(FrameError::NeedsRuntime)
    }

    fn next_frag(&mut self) -> FrameResult<bool> {
        Err(FrameError::NeedsRuntime)
    }

    fn get_var(&self, _: &Identifier) -> FrameResult<Value<'static>> {
        Err(FrameError::NeedsRuntime)
    }

    fn set_var(&mut self, _: &Identifier, _: Value<'static>) -> FrameResult<bool> {
        Err(FrameError::NeedsRuntime)
    }

    fn list_pos(&self, _: &Identifier) -> FrameResult<ListPos> {
        Err(FrameError::NeedsRuntime)
    }

    fn frag(&self, _: u16, _: u16) -> FrameResult<Value<'static>> {
        Err(FrameError::NeedsRuntime)
    }

    fn frag_attr(&self, _: &Value<'static>, _: &str) -> FrameResult<Value<'static>> {
        Err(FrameError::NeedsRuntime)
    }

    fn value_at(&self, _: &Value<'static>, _: &Value<'static>) -> FrameResult<Value<'static>> {
        Err(FrameError::NeedsRuntime)
    }

    fn top_depth(&self) -> usize {
        0
    }

    fn root(&self) -> Option<&'static Fragment> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn ident(name: &str, frame: u16, frag: u16) -> Identifier {
        Identifier {
            path: smallvec![name.to_owned()],
            offsets: Some((frame, frag)),
        }
    }

    fn sample() -> Fragment {
        let mut root = Fragment::new();
        root.add_string("title", "Title");
        let items = root.add_fragment_list("items");
        items.add_fragment().add_string("name", "a");
        items.add_fragment().add_string("name", "b");
        root
    }

    #[test]
    fn iteration_walks_the_list() {
        let root = sample();
        let mut frames = OpenFrames::new(&root);
        assert!(frames.open_frag("items").unwrap());

        let name = frames.get_var(&ident("name", 0, 0)).unwrap();
        assert_eq!(name.as_str(), Some("a"));
        let pos = frames.list_pos(&ident("items", 0, 0)).unwrap();
        assert_eq!((pos.index, pos.size), (0, 2));

        assert!(frames.next_frag().unwrap());
        let name = frames.get_var(&ident("name", 0, 0)).unwrap();
        assert_eq!(name.as_str(), Some("b"));

        assert!(!frames.next_frag().unwrap());
        assert_eq!(frames.top_depth(), 1);
    }

    #[test]
    fn missing_or_empty_fragments_do_not_open() {
        let mut root = sample();
        root.add_fragment_list("empty");
        let mut frames = OpenFrames::new(&root);
        assert!(!frames.open_frag("missing").unwrap());
        assert!(!frames.open_frag("empty").unwrap());
        assert!(!frames.open_frag("title").unwrap());
    }

    #[test]
    fn locals_shadow_nothing_and_die_on_iteration() {
        let root = sample();
        let mut frames = OpenFrames::new(&root);
        frames.open_frag("items").unwrap();

        // data names cannot be shadowed
        assert!(!frames.set_var(&ident("name", 0, 0), Value::Int(1)).unwrap());
        // fresh locals work
        assert!(frames.set_var(&ident("tmp", 0, 0), Value::Int(7)).unwrap());
        assert_eq!(frames.get_var(&ident("tmp", 0, 0)).unwrap().as_int(), Some(7));

        // next iteration starts clean
        frames.next_frag().unwrap();
        assert!(frames.get_var(&ident("tmp", 0, 0)).unwrap().is_undefined());
    }

    #[test]
    fn reopening_root_uses_a_new_frame() {
        let root = sample();
        let mut frames = OpenFrames::new(&root);
        frames.open_frag("items").unwrap();
        frames.open_frame().unwrap();
        frames.open_frag("items").unwrap();

        // outer frame's iteration is reachable at frame offset 1
        let outer = frames.get_var(&ident("name", 1, 0)).unwrap();
        assert_eq!(outer.as_str(), Some("a"));

        frames.next_frag().unwrap();
        frames.close_frame().unwrap();
        assert_eq!(frames.depth(), 1);
    }

    #[test]
    fn lone_list_promotion() {
        let mut root = Fragment::new();
        let list = root.add_fragment_list("a");
        list.add_fragment().add_string("b", "deep");
        let frames = OpenFrames::new(&root);

        let a = frames.get_var(&ident("a", 0, 0)).unwrap();
        let b = frames.frag_attr(&a, "b").unwrap();
        assert_eq!(b.as_str(), Some("deep"));
    }

    #[test]
    fn const_frames_need_runtime() {
        let mut stub = ConstFrames;
        assert_eq!(stub.open_frag("x"), Err(FrameError::NeedsRuntime));
        assert!(matches!(
            stub.get_var(&ident("x", 0, 0)),
            Err(FrameError::NeedsRuntime)
        ));
    }
}
