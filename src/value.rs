use std::{
    collections::{HashMap, HashSet},
    fmt,
};

/// How deep `Display` is willing to descend. The graph is acyclic, but
/// shared objects can still nest deeply.
pub const MAX_DEPTH: usize = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// The type tag of an object.
pub enum ObjectTag {
    None,
    Mark,
    Bool,
    Int,
    Float,
    String,
    Bytes,
    Seq,
    Dict,
    Set,
    Global,
    Reduce,
    Built,
}

impl ObjectTag {
    pub fn name(self) -> &'static str {
        match self {
            ObjectTag::None => "NONE",
            ObjectTag::Mark => "MARK",
            ObjectTag::Bool => "BOOL",
            ObjectTag::Int => "INT",
            ObjectTag::Float => "FLOAT",
            ObjectTag::String => "STRING",
            ObjectTag::Bytes => "BYTES",
            ObjectTag::Seq => "SEQ",
            ObjectTag::Dict => "DICT",
            ObjectTag::Set => "SET",
            ObjectTag::Global => "GLOBAL",
            ObjectTag::Reduce => "REDUCE",
            ObjectTag::Built => "OBJECT",
        }
    }
}

impl fmt::Display for ObjectTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// A reference to an object living in a [`Heap`]. Once the object is freed
/// its slot may be reused, but old references will no longer resolve.
pub struct ObjRef {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, PartialEq)]
/// A decoded pickle object.
pub enum Object {
    /// Python `None`.
    None,

    /// Stack sentinel. Never ends up inside a finished container.
    Mark,

    Bool(bool),

    Int(i64),

    Float(f64),

    /// A unicode string (or a legacy string that happened to be valid UTF-8).
    String(String),

    /// Some bytes. Owned, the input buffer can go away.
    Bytes(Vec<u8>),

    /// Lists and tuples. We don't care which.
    Seq(Vec<ObjRef>),

    /// Interleaved `[k, v, k, v, ...]`.
    Dict(Vec<ObjRef>),

    /// Sets and frozensets.
    Set(Vec<ObjRef>),

    /// `(module, qualified name)`, both strings.
    Global([ObjRef; 2]),

    /// `(callable, arguments)`. We obviously don't call anything.
    Reduce([ObjRef; 2]),

    /// `(reduce result, state)` from `BUILD`. This is the finished object.
    Built([ObjRef; 2]),
}

impl Object {
    pub fn tag(&self) -> ObjectTag {
        match self {
            Object::None => ObjectTag::None,
            Object::Mark => ObjectTag::Mark,
            Object::Bool(_) => ObjectTag::Bool,
            Object::Int(_) => ObjectTag::Int,
            Object::Float(_) => ObjectTag::Float,
            Object::String(_) => ObjectTag::String,
            Object::Bytes(_) => ObjectTag::Bytes,
            Object::Seq(_) => ObjectTag::Seq,
            Object::Dict(_) => ObjectTag::Dict,
            Object::Set(_) => ObjectTag::Set,
            Object::Global(_) => ObjectTag::Global,
            Object::Reduce(_) => ObjectTag::Reduce,
            Object::Built(_) => ObjectTag::Built,
        }
    }

    /// Child references, empty for scalars.
    pub fn children(&self) -> &[ObjRef] {
        match self {
            Object::Seq(items) | Object::Dict(items) | Object::Set(items) => items,
            Object::Global(pair) | Object::Reduce(pair) | Object::Built(pair) => pair,
            _ => &[],
        }
    }

    /// The growable child list of the containers that opcodes mutate in place.
    pub(crate) fn items_mut(&mut self) -> Option<&mut Vec<ObjRef>> {
        match self {
            Object::Seq(items) | Object::Dict(items) | Object::Set(items) => Some(items),
            _ => None,
        }
    }

    fn into_children(self) -> Vec<ObjRef> {
        match self {
            Object::Seq(items) | Object::Dict(items) | Object::Set(items) => items,
            Object::Global(pair) | Object::Reduce(pair) | Object::Built(pair) => pair.to_vec(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    object: Object,
    refcount: u32,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Debug, Clone, Default)]
/// Arena owning every object created while interpreting a pickle.
///
/// Each live object carries a reference count. Holders (the stack, the memo,
/// parent containers) own one count each. When the count drops to zero the
/// object is freed and its children released in turn.
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an object with a reference count of one.
    pub fn alloc(&mut self, object: Object) -> ObjRef {
        let entry = Some(Entry {
            object,
            refcount: 1,
        });
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = entry;
            return ObjRef {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry,
        });
        ObjRef {
            index,
            generation: 0,
        }
    }

    fn entry(&self, r: ObjRef) -> Option<&Entry> {
        self.slots
            .get(r.index as usize)
            .filter(|slot| slot.generation == r.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn entry_mut(&mut self, r: ObjRef) -> Option<&mut Entry> {
        self.slots
            .get_mut(r.index as usize)
            .filter(|slot| slot.generation == r.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    pub fn get(&self, r: ObjRef) -> Option<&Object> {
        self.entry(r).map(|e| &e.object)
    }

    pub fn get_mut(&mut self, r: ObjRef) -> Option<&mut Object> {
        self.entry_mut(r).map(|e| &mut e.object)
    }

    pub fn tag(&self, r: ObjRef) -> Option<ObjectTag> {
        self.get(r).map(Object::tag)
    }

    pub fn refcount(&self, r: ObjRef) -> Option<u32> {
        self.entry(r).map(|e| e.refcount)
    }

    /// Number of objects currently alive.
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Take another reference to an object.
    pub fn retain(&mut self, r: ObjRef) -> ObjRef {
        match self.entry_mut(r) {
            Some(e) => e.refcount += 1,
            None => debug_assert!(false, "retain of dead object {r:?}"),
        }
        r
    }

    /// Drop a reference. Objects reaching zero are freed along with
    /// everything only they were keeping alive.
    pub fn release(&mut self, r: ObjRef) {
        let mut pending = vec![r];
        while let Some(r) = pending.pop() {
            let Some(slot) = self
                .slots
                .get_mut(r.index as usize)
                .filter(|slot| slot.generation == r.generation)
            else {
                debug_assert!(false, "release of dead object {r:?}");
                continue;
            };
            let Some(entry) = slot.entry.as_mut() else {
                debug_assert!(false, "release of dead object {r:?}");
                continue;
            };
            entry.refcount -= 1;
            if entry.refcount > 0 {
                continue;
            }
            if let Some(entry) = slot.entry.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(r.index);
                self.live -= 1;
                pending.extend(entry.object.into_children());
            }
        }
    }

    /// Whether `target` is `from` itself or can be reached from it through
    /// child references.
    pub fn reaches(&self, from: ObjRef, target: ObjRef) -> bool {
        let mut seen = HashSet::new();
        let mut pending = vec![from];
        while let Some(r) = pending.pop() {
            if r == target {
                return true;
            }
            if !seen.insert(r) {
                continue;
            }
            if let Some(obj) = self.get(r) {
                pending.extend_from_slice(obj.children());
            }
        }
        false
    }

    pub fn view(&self, r: ObjRef) -> View<'_> {
        View { heap: self, id: r }
    }
}

#[derive(Debug, Clone)]
/// A fully decoded pickle: the heap and the single root object in it.
pub struct Pickle {
    heap: Heap,
    root: ObjRef,
}

impl Pickle {
    pub(crate) fn new(heap: Heap, root: ObjRef) -> Self {
        Self { heap, root }
    }

    pub fn root(&self) -> View<'_> {
        self.heap.view(self.root)
    }

    pub fn root_ref(&self) -> ObjRef {
        self.root
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }
}

#[derive(Clone, Copy)]
/// A borrowed handle for walking the object graph.
///
/// All lookups that expect a particular tag return `None` on a mismatch,
/// which is how callers tell "not the shape I wanted" apart from real errors.
pub struct View<'a> {
    heap: &'a Heap,
    id: ObjRef,
}

impl<'a> View<'a> {
    pub fn id(&self) -> ObjRef {
        self.id
    }

    /// The object, or `None` for a dangling reference.
    pub fn object(&self) -> Option<&'a Object> {
        self.heap.get(self.id)
    }

    pub fn tag(&self) -> Option<ObjectTag> {
        self.object().map(Object::tag)
    }

    pub fn is(&self, tag: ObjectTag) -> bool {
        self.tag() == Some(tag)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.object()? {
            Object::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.object()? {
            Object::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self.object()? {
            Object::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&'a str> {
        match self.object()? {
            Object::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self.object()? {
            Object::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Number of children.
    pub fn len(&self) -> usize {
        self.object().map_or(0, |o| o.children().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn children(&self) -> impl Iterator<Item = View<'a>> + 'a {
        let heap = self.heap;
        self.object()
            .map(Object::children)
            .unwrap_or_default()
            .iter()
            .map(move |&id| View { heap, id })
    }

    /// The child at `index`, provided the parent is a sequence-like object
    /// (not a dict or set) and the child has the expected tag.
    pub fn child(&self, index: usize, tag: ObjectTag) -> Option<View<'a>> {
        self.child_any(index).filter(|c| c.is(tag))
    }

    /// Like [`View::child`] without the tag check.
    pub fn child_any(&self, index: usize) -> Option<View<'a>> {
        let items = match self.object()? {
            Object::Seq(items) => items.as_slice(),
            Object::Global(pair) | Object::Reduce(pair) | Object::Built(pair) => pair.as_slice(),
            _ => return None,
        };
        items.get(index).map(|&id| View {
            heap: self.heap,
            id,
        })
    }

    /// The last child, if it has the expected tag.
    pub fn last_child(&self, tag: ObjectTag) -> Option<View<'a>> {
        let n = self.len();
        if n == 0 {
            return None;
        }
        self.child(n - 1, tag)
    }

    /// The first child with the given tag.
    pub fn find_child(&self, tag: ObjectTag) -> Option<View<'a>> {
        (0..self.len()).find_map(|i| self.child(i, tag))
    }

    /// Whether this is `Global(module, name)`.
    pub fn is_global(&self, module: &str, name: &str) -> bool {
        if !self.is(ObjectTag::Global) {
            return false;
        }
        let part = |i| self.child(i, ObjectTag::String).and_then(|v| v.as_str());
        part(0) == Some(module) && part(1) == Some(name)
    }

    /// Key/value pairs of a dict. Empty for anything else.
    pub fn dict_items(&self) -> impl Iterator<Item = (View<'a>, View<'a>)> + 'a {
        let heap = self.heap;
        let items: &'a [ObjRef] = match self.object() {
            Some(Object::Dict(items)) => items.as_slice(),
            _ => &[],
        };
        items
            .chunks_exact(2)
            .map(move |kv| (View { heap, id: kv[0] }, View { heap, id: kv[1] }))
    }

    /// Shared containers are labelled `#n` the first time they are printed,
    /// later visits print `<ref #n>` only.
    fn dump(
        &self,
        f: &mut fmt::Formatter<'_>,
        depth: usize,
        shared: &mut HashMap<ObjRef, usize>,
    ) -> fmt::Result {
        for _ in 0..depth {
            f.write_str("    ")?;
        }
        let Some(obj) = self.object() else {
            return writeln!(f, "<dangling>");
        };
        if let Some(n) = shared.get(&self.id) {
            return writeln!(f, "<ref #{n}>");
        }
        write!(f, "{}", obj.tag())?;
        match obj {
            Object::None | Object::Mark => writeln!(f)?,
            Object::Bool(b) => writeln!(f, "({})", if *b { "True" } else { "False" })?,
            Object::Int(i) => writeln!(f, "({i})")?,
            Object::Float(v) => writeln!(f, "({v})")?,
            Object::String(s) => writeln!(f, "('{s}')")?,
            Object::Bytes(b) => writeln!(f, "(len={})", b.len())?,
            _ => {
                write!(f, "(nitems={})", obj.children().len())?;
                if self.heap.refcount(self.id).unwrap_or_default() > 1 {
                    let n = shared.len();
                    shared.insert(self.id, n);
                    write!(f, " #{n}")?;
                }
                writeln!(f)?;
                if depth + 1 >= MAX_DEPTH {
                    return Ok(());
                }
                for child in self.children() {
                    child.dump(f, depth + 1, shared)?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for View<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("id", &self.id)
            .field("tag", &self.tag())
            .finish()
    }
}

/// Indented tree dump, one object per line.
impl fmt::Display for View<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dump(f, 0, &mut HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_frees_children() {
        let mut heap = Heap::new();
        let a = heap.alloc(Object::Int(1));
        let b = heap.alloc(Object::String("x".into()));
        let seq = heap.alloc(Object::Seq(vec![a, b]));
        assert_eq!(heap.live_count(), 3);

        heap.release(seq);
        assert_eq!(heap.live_count(), 0);
        assert!(heap.get(a).is_none());
        assert!(heap.get(seq).is_none());
    }

    #[test]
    fn shared_child_outlives_parent() {
        let mut heap = Heap::new();
        let s = heap.alloc(Object::String("numpy".into()));
        let keep = heap.retain(s);
        let seq = heap.alloc(Object::Seq(vec![s]));
        assert_eq!(heap.refcount(s), Some(2));

        heap.release(seq);
        assert_eq!(heap.live_count(), 1);
        assert_eq!(heap.refcount(keep), Some(1));
        heap.release(keep);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn stale_references_do_not_resolve() {
        let mut heap = Heap::new();
        let old = heap.alloc(Object::None);
        heap.release(old);
        let new = heap.alloc(Object::Bool(true));
        // The slot got reused, the old handle must not see the new object.
        assert!(heap.get(old).is_none());
        assert_eq!(heap.get(new), Some(&Object::Bool(true)));
    }

    #[test]
    fn view_navigation() {
        let mut heap = Heap::new();
        let m = heap.alloc(Object::String("numpy".into()));
        let n = heap.alloc(Object::String("ndarray".into()));
        let g = heap.alloc(Object::Global([m, n]));
        let i = heap.alloc(Object::Int(7));
        let seq = heap.alloc(Object::Seq(vec![g, i]));
        let v = heap.view(seq);

        assert_eq!(v.len(), 2);
        assert!(v.child(0, ObjectTag::Global).unwrap().is_global("numpy", "ndarray"));
        assert!(v.child(0, ObjectTag::Int).is_none());
        assert!(v.child(5, ObjectTag::Int).is_none());
        assert_eq!(v.last_child(ObjectTag::Int).and_then(|c| c.as_int()), Some(7));
        assert_eq!(v.find_child(ObjectTag::Int).and_then(|c| c.as_int()), Some(7));
        assert!(heap.view(i).child_any(0).is_none());
    }

    #[test]
    fn dump_format() {
        let mut heap = Heap::new();
        let k = heap.alloc(Object::String("Direction".into()));
        let v = heap.alloc(Object::Int(2));
        let d = heap.alloc(Object::Dict(vec![k, v]));
        let text = heap.view(d).to_string();
        assert_eq!(text, "DICT(nitems=2)\n    STRING('Direction')\n    INT(2)\n");
        let pairs: Vec<_> = heap
            .view(d)
            .dict_items()
            .map(|(k, v)| (k.as_str(), v.as_int()))
            .collect();
        assert_eq!(pairs, vec![(Some("Direction"), Some(2))]);
    }
}
