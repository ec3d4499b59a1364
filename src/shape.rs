use crate::{
    ops::StackShape,
    value::{Heap, ObjRef, ObjectTag},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// A successful stack check. For the slice consuming shapes this records
/// where the nearest mark is.
pub struct StackCheck {
    pub mark: Option<usize>,
}

/// Find the position of the topmost mark.
pub fn find_mark(stack: &[ObjRef], heap: &Heap) -> Option<usize> {
    stack
        .iter()
        .rposition(|&r| heap.tag(r) == Some(ObjectTag::Mark))
}

/// Check the stack against a shape contract. Returns `None` if it does not match.
///
/// "Any object" never matches a mark: marks only exist to delimit slices.
pub fn check_stack(stack: &[ObjRef], heap: &Heap, shape: StackShape) -> Option<StackCheck> {
    use StackShape as S;

    let n = stack.len();
    let tag_at = |i: usize| heap.tag(stack[i]);
    let top_is = |tags: &[ObjectTag]| n >= 1 && tag_at(n - 1).is_some_and(|t| tags.contains(&t));
    let objects_on_top = |k: usize| {
        n >= k
            && stack[n - k..]
                .iter()
                .all(|&r| heap.tag(r).is_some_and(|t| t != ObjectTag::Mark))
    };

    let ok = match shape {
        S::Void => true,
        S::AnyObject => objects_on_top(1),
        S::AnyObject2 => objects_on_top(2),
        S::AnyObject3 => objects_on_top(3),

        S::PyUnicodePyUnicode => {
            n >= 2
                && tag_at(n - 1) == Some(ObjectTag::String)
                && tag_at(n - 2) == Some(ObjectTag::String)
        }
        S::PyListAnyObject => n >= 2 && tag_at(n - 2) == Some(ObjectTag::Seq) && objects_on_top(1),
        S::PyDictAnyObject2 => {
            n >= 3 && tag_at(n - 3) == Some(ObjectTag::Dict) && objects_on_top(2)
        }

        S::MarkObjectStackSlice
        | S::MarkObjectAnyObjectStackSlice
        | S::PyListMarkObjectStackSlice
        | S::PySetMarkObjectStackSlice
        | S::PyDictMarkObjectStackSlice => {
            let mark = find_mark(stack, heap)?;
            let above = n - mark - 1;
            let target = |tag| mark >= 1 && tag_at(mark - 1) == Some(tag);
            let ok = match shape {
                S::MarkObjectAnyObjectStackSlice => above >= 1,
                S::PyListMarkObjectStackSlice => target(ObjectTag::Seq),
                S::PySetMarkObjectStackSlice => target(ObjectTag::Set),
                // Updates a dict, so the slice has to be (key, value) pairs.
                S::PyDictMarkObjectStackSlice => target(ObjectTag::Dict) && above % 2 == 0,
                _ => true,
            };
            return ok.then_some(StackCheck { mark: Some(mark) });
        }

        S::MarkObject => top_is(&[ObjectTag::Mark]),
        S::PyBool => top_is(&[ObjectTag::Bool]),
        S::PyBytes => top_is(&[ObjectTag::Bytes]),
        S::PyBytesOrStr => top_is(&[ObjectTag::Bytes, ObjectTag::String]),
        S::PyDict => top_is(&[ObjectTag::Dict]),
        S::PyFloat => top_is(&[ObjectTag::Float]),
        S::PyFrozenSet | S::PySet => top_is(&[ObjectTag::Set]),
        S::PyInt => top_is(&[ObjectTag::Int]),
        S::PyIntegerOrBool => top_is(&[ObjectTag::Int, ObjectTag::Bool]),
        S::PyList | S::PyTuple => top_is(&[ObjectTag::Seq]),
        S::PyNone => top_is(&[ObjectTag::None]),
        S::PyUnicode => top_is(&[ObjectTag::String]),
    };
    ok.then_some(StackCheck::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Object;

    fn stack_of(heap: &mut Heap, objs: Vec<Object>) -> Vec<ObjRef> {
        objs.into_iter().map(|o| heap.alloc(o)).collect()
    }

    #[test]
    fn arity() {
        let mut heap = Heap::new();
        let stack = stack_of(&mut heap, vec![Object::Int(1), Object::Int(2)]);
        assert!(check_stack(&stack, &heap, StackShape::Void).is_some());
        assert!(check_stack(&stack, &heap, StackShape::AnyObject2).is_some());
        assert!(check_stack(&stack, &heap, StackShape::AnyObject3).is_none());
        assert!(check_stack(&[], &heap, StackShape::AnyObject).is_none());
    }

    #[test]
    fn marks_are_not_objects() {
        let mut heap = Heap::new();
        let stack = stack_of(&mut heap, vec![Object::Seq(vec![]), Object::Mark]);
        assert!(check_stack(&stack, &heap, StackShape::AnyObject).is_none());
        assert!(check_stack(&stack, &heap, StackShape::PyListAnyObject).is_none());
        assert!(check_stack(&stack, &heap, StackShape::MarkObject).is_some());
    }

    #[test]
    fn mark_slices() {
        let mut heap = Heap::new();
        let stack = stack_of(
            &mut heap,
            vec![
                Object::Dict(vec![]),
                Object::Mark,
                Object::String("k".into()),
                Object::Int(1),
            ],
        );
        let check = check_stack(&stack, &heap, StackShape::PyDictMarkObjectStackSlice).unwrap();
        assert_eq!(check.mark, Some(1));
        assert!(check_stack(&stack, &heap, StackShape::MarkObjectAnyObjectStackSlice).is_some());
        assert!(check_stack(&stack, &heap, StackShape::PyListMarkObjectStackSlice).is_none());
        assert!(check_stack(&stack, &heap, StackShape::PySetMarkObjectStackSlice).is_none());

        // Odd number of items above the mark.
        assert!(check_stack(&stack[..3], &heap, StackShape::PyDictMarkObjectStackSlice).is_none());
        // Empty slice is fine for plain slices, not when an object is required.
        assert!(check_stack(&stack[..2], &heap, StackShape::MarkObjectStackSlice).is_some());
        assert!(
            check_stack(&stack[..2], &heap, StackShape::MarkObjectAnyObjectStackSlice).is_none()
        );
        // Nothing below the mark.
        assert!(check_stack(&stack[1..], &heap, StackShape::PyDictMarkObjectStackSlice).is_none());
    }

    #[test]
    fn no_mark() {
        let mut heap = Heap::new();
        let stack = stack_of(&mut heap, vec![Object::Int(1), Object::Int(2)]);
        assert!(check_stack(&stack, &heap, StackShape::MarkObjectStackSlice).is_none());
        assert_eq!(find_mark(&stack, &heap), None);
    }

    #[test]
    fn typed_pairs() {
        let mut heap = Heap::new();
        let stack = stack_of(
            &mut heap,
            vec![Object::String("numpy".into()), Object::String("dtype".into())],
        );
        assert!(check_stack(&stack, &heap, StackShape::PyUnicodePyUnicode).is_some());
        let stack = stack_of(&mut heap, vec![Object::String("numpy".into()), Object::Int(3)]);
        assert!(check_stack(&stack, &heap, StackShape::PyUnicodePyUnicode).is_none());
    }
}
