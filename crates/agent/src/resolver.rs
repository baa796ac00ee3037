//! Element resolution
//!
//! Maps an identifier and a frame hint to exactly one live element, and runs
//! the typed queries behind `findElementsBy*`.

use crate::host::{ElementHandle, ElementProperties, ViewTree};
use regex::{Regex, RegexBuilder};
use serde_json::{json, Value};
use std::collections::HashSet;
use synctap_common::{AccessibilityTrait, ElementDescriptor, Error, Rect, Result};
use tracing::{debug, trace};

/// Pre-order walk over every attached surface, in host order
pub struct TreeWalk<'a, T: ViewTree + ?Sized> {
    tree: &'a T,
    stack: Vec<ElementHandle>,
}

impl<'a, T: ViewTree + ?Sized> TreeWalk<'a, T> {
    pub fn new(tree: &'a T) -> Self {
        let mut stack = tree.surfaces();
        stack.reverse();
        Self { tree, stack }
    }
}

impl<'a, T: ViewTree + ?Sized> Iterator for TreeWalk<'a, T> {
    type Item = ElementHandle;

    fn next(&mut self) -> Option<Self::Item> {
        let element = self.stack.pop()?;
        let mut children = self.tree.children(element);
        children.reverse();
        self.stack.extend(children);
        Some(element)
    }
}

/// Text predicate, exact or regular expression
#[derive(Debug, Clone)]
pub enum TextPattern {
    Exact(String),
    Regex(Regex),
}

impl TextPattern {
    /// Build a pattern; regex input may be a bare pattern or a `/pattern/flags` literal
    pub fn new(text: &str, is_regex: bool) -> Result<Self> {
        if !is_regex {
            return Ok(TextPattern::Exact(text.to_string()));
        }

        let (pattern, flags) = split_regex_literal(text);
        let mut builder = RegexBuilder::new(pattern);
        for flag in flags.chars() {
            match flag {
                'i' => {
                    builder.case_insensitive(true);
                }
                'm' => {
                    builder.multi_line(true);
                }
                's' => {
                    builder.dot_matches_new_line(true);
                }
                // global, sticky and unicode carry no meaning for a single match
                'g' | 'y' | 'u' => {}
                other => {
                    return Err(Error::InvalidParameterType {
                        action: "findElementsByText".to_string(),
                        reason: format!("unsupported regex flag `{}`", other),
                    })
                }
            }
        }

        builder
            .build()
            .map(TextPattern::Regex)
            .map_err(|e| Error::InvalidParameterType {
                action: "findElementsByText".to_string(),
                reason: format!("invalid regex `{}`: {}", pattern, e),
            })
    }

    pub fn is_match(&self, text: &str) -> bool {
        match self {
            TextPattern::Exact(expected) => expected == text,
            TextPattern::Regex(re) => re.is_match(text),
        }
    }
}

fn split_regex_literal(text: &str) -> (&str, &str) {
    if let Some(body) = text.strip_prefix('/') {
        if let Some(end) = body.rfind('/') {
            let flags = &body[end + 1..];
            if flags.chars().all(|c| c.is_ascii_alphabetic()) {
                return (&body[..end], flags);
            }
        }
    }
    (text, "")
}

/// Predicate applied to each element during a walk
#[derive(Debug, Clone)]
pub enum Matcher {
    Identifier(String),
    Text(TextPattern),
    /// Concrete type or any supertype/protocol in the host class chain
    Type(String),
    /// Accessible elements carrying every listed trait
    Traits(Vec<AccessibilityTrait>),
}

impl Matcher {
    pub fn matches(&self, props: &ElementProperties) -> bool {
        match self {
            Matcher::Identifier(identifier) => {
                props.identifier.as_deref() == Some(identifier.as_str())
            }
            Matcher::Text(pattern) => props
                .text
                .as_deref()
                .map(|text| pattern.is_match(text))
                .unwrap_or(false),
            Matcher::Type(name) => props.class_names.iter().any(|c| c == name),
            Matcher::Traits(traits) => {
                props.is_accessibility_element
                    && traits.iter().all(|t| props.traits.contains(t))
            }
        }
    }
}

/// Element returned from a query
#[derive(Debug, Clone, PartialEq)]
pub struct FoundElement {
    pub handle: ElementHandle,
    pub identifier: String,
    pub frame: Rect,
}

impl FoundElement {
    pub fn to_json(&self) -> Value {
        json!({
            "identifier": self.identifier,
            "frame": self.frame.components(),
        })
    }
}

/// Resolve a descriptor to exactly one live element.
///
/// Candidates are ranked by how much their frame overlaps the hint; the first
/// candidate in walk order wins ties.
pub fn resolve<T: ViewTree + ?Sized>(
    tree: &T,
    descriptor: &ElementDescriptor,
) -> Result<ElementHandle> {
    let matcher = Matcher::Identifier(descriptor.identifier.clone());
    let mut scanned = 0usize;
    let mut candidates: Vec<(ElementHandle, Rect)> = Vec::new();

    for element in TreeWalk::new(tree) {
        scanned += 1;
        let Some(props) = tree.properties(element) else {
            continue;
        };
        if matcher.matches(&props) {
            candidates.push((element, props.frame));
        }
    }

    trace!(
        "Resolving {}: {} candidates out of {} elements",
        descriptor,
        candidates.len(),
        scanned
    );

    match candidates.as_slice() {
        [] => Err(Error::ElementNotFound {
            identifier: descriptor.identifier.clone(),
            frame: descriptor.hint_frame,
            scanned,
        }),
        [(only, _)] => Ok(*only),
        _ => {
            let mut best = candidates[0].0;
            let mut best_ratio = f64::NEG_INFINITY;

            for (element, frame) in &candidates {
                let hint = descriptor.hint_frame.constrained_to(frame);
                let ratio = frame.intersection_ratio(&hint);
                if ratio > best_ratio {
                    best = *element;
                    best_ratio = ratio;
                }
            }

            debug!(
                "Resolved {} to {:?} with intersection ratio {:.3}",
                descriptor, best, best_ratio
            );
            Ok(best)
        }
    }
}

/// Run a query and return the outermost accessible element for each match.
///
/// Matches without an accessible outermost ancestor, or whose ancestor has no
/// identifier, are dropped. Results keep first-seen order without duplicates.
pub fn find<T: ViewTree + ?Sized>(tree: &T, matcher: &Matcher) -> Vec<FoundElement> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();

    for element in TreeWalk::new(tree) {
        let Some(props) = tree.properties(element) else {
            continue;
        };
        if !matcher.matches(&props) {
            continue;
        }

        let (outermost, outer_props) = outermost_accessible(tree, element, props);
        if !outer_props.is_accessibility_element || !seen.insert(outermost) {
            continue;
        }

        if let Some(identifier) = outer_props.identifier {
            found.push(FoundElement {
                handle: outermost,
                identifier,
                frame: outer_props.frame,
            });
        }
    }

    debug!("Query {:?} matched {} elements", matcher, found.len());
    found
}

fn outermost_accessible<T: ViewTree + ?Sized>(
    tree: &T,
    element: ElementHandle,
    props: ElementProperties,
) -> (ElementHandle, ElementProperties) {
    let mut current = (element, props);

    while let Some(parent) = tree.parent(current.0) {
        match tree.properties(parent) {
            Some(parent_props) if parent_props.is_accessibility_element => {
                current = (parent, parent_props);
            }
            _ => break,
        }
    }

    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct TestTree {
        roots: Vec<ElementHandle>,
        children: HashMap<ElementHandle, Vec<ElementHandle>>,
        parents: HashMap<ElementHandle, ElementHandle>,
        props: HashMap<ElementHandle, ElementProperties>,
    }

    impl TestTree {
        fn add(
            &mut self,
            id: u64,
            parent: Option<u64>,
            identifier: Option<&str>,
            frame: Rect,
            accessible: bool,
        ) -> ElementHandle {
            let handle = ElementHandle(id);
            match parent {
                Some(p) => {
                    self.children.entry(ElementHandle(p)).or_default().push(handle);
                    self.parents.insert(handle, ElementHandle(p));
                }
                None => self.roots.push(handle),
            }
            self.props.insert(
                handle,
                ElementProperties {
                    identifier: identifier.map(str::to_string),
                    frame,
                    text: identifier.map(|i| format!("{} label", i)),
                    class_names: vec!["View".to_string()],
                    traits: Vec::new(),
                    is_accessibility_element: accessible,
                },
            );
            handle
        }
    }

    impl ViewTree for TestTree {
        fn surfaces(&self) -> Vec<ElementHandle> {
            self.roots.clone()
        }

        fn children(&self, element: ElementHandle) -> Vec<ElementHandle> {
            self.children.get(&element).cloned().unwrap_or_default()
        }

        fn parent(&self, element: ElementHandle) -> Option<ElementHandle> {
            self.parents.get(&element).copied()
        }

        fn properties(&self, element: ElementHandle) -> Option<ElementProperties> {
            self.props.get(&element).cloned()
        }

        fn attributes(&self, _element: ElementHandle) -> Value {
            Value::Null
        }
    }

    fn screen() -> Rect {
        Rect::new(0.0, 0.0, 400.0, 800.0)
    }

    #[test]
    fn test_walk_is_preorder_across_surfaces() {
        let mut tree = TestTree::default();
        tree.add(1, None, None, screen(), false);
        tree.add(2, Some(1), None, screen(), false);
        tree.add(3, Some(2), None, screen(), false);
        tree.add(4, Some(1), None, screen(), false);
        tree.add(5, None, None, screen(), false);

        let order: Vec<u64> = TreeWalk::new(&tree).map(|h| h.0).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_resolve_prefers_overlap_with_hint() {
        let mut tree = TestTree::default();
        tree.add(1, None, None, screen(), false);
        tree.add(2, Some(1), Some("Btn1"), Rect::new(0.0, 0.0, 100.0, 40.0), true);
        tree.add(3, Some(1), Some("Btn1"), Rect::new(0.0, 500.0, 100.0, 40.0), true);

        let descriptor = ElementDescriptor::new("Btn1", Rect::new(0.0, 495.0, 100.0, 40.0));
        assert_eq!(resolve(&tree, &descriptor).unwrap(), ElementHandle(3));
    }

    #[test]
    fn test_resolve_duplicate_identifier_by_hint_overlap() {
        let mut tree = TestTree::default();
        tree.add(1, None, None, screen(), false);
        tree.add(2, Some(1), Some("Btn1"), Rect::new(0.0, 0.0, 100.0, 40.0), true);
        tree.add(3, Some(1), Some("Btn1"), Rect::new(500.0, 500.0, 100.0, 40.0), true);

        let descriptor = ElementDescriptor::new("Btn1", Rect::new(10.0, 5.0, 90.0, 35.0));
        assert_eq!(resolve(&tree, &descriptor).unwrap(), ElementHandle(2));
    }

    #[test]
    fn test_resolve_single_candidate_ignores_hint() {
        let mut tree = TestTree::default();
        tree.add(1, None, None, screen(), false);
        tree.add(2, Some(1), Some("Only"), Rect::new(0.0, 0.0, 10.0, 10.0), true);

        let descriptor = ElementDescriptor::new("Only", Rect::new(300.0, 700.0, 5.0, 5.0));
        assert_eq!(resolve(&tree, &descriptor).unwrap(), ElementHandle(2));
    }

    #[test]
    fn test_resolve_ties_go_to_first_in_walk_order() {
        let mut tree = TestTree::default();
        tree.add(1, None, None, screen(), false);
        tree.add(2, Some(1), Some("Row"), Rect::new(0.0, 0.0, 100.0, 40.0), true);
        tree.add(3, None, None, screen(), false);
        tree.add(4, Some(3), Some("Row"), Rect::new(0.0, 0.0, 100.0, 40.0), true);

        let descriptor = ElementDescriptor::new("Row", Rect::unconstrained());
        assert_eq!(resolve(&tree, &descriptor).unwrap(), ElementHandle(2));
    }

    #[test]
    fn test_resolve_unconstrained_axis_uses_candidate_extent() {
        let mut tree = TestTree::default();
        tree.add(1, None, None, screen(), false);
        tree.add(2, Some(1), Some("Cell"), Rect::new(0.0, 0.0, 400.0, 40.0), true);
        tree.add(3, Some(1), Some("Cell"), Rect::new(0.0, 200.0, 400.0, 40.0), true);

        // Only the vertical axis is constrained
        let hint = Rect::new(f64::NAN, 200.0, f64::NAN, 40.0);
        let descriptor = ElementDescriptor::new("Cell", hint);
        assert_eq!(resolve(&tree, &descriptor).unwrap(), ElementHandle(3));
    }

    #[test]
    fn test_resolve_not_found_reports_scan() {
        let mut tree = TestTree::default();
        tree.add(1, None, None, screen(), false);
        tree.add(2, Some(1), Some("Other"), screen(), true);

        let descriptor = ElementDescriptor::new("Missing", Rect::new(0.0, 0.0, 1.0, 1.0));
        match resolve(&tree, &descriptor) {
            Err(Error::ElementNotFound {
                identifier,
                scanned,
                ..
            }) => {
                assert_eq!(identifier, "Missing");
                assert_eq!(scanned, 2);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_find_climbs_to_outermost_accessible_ancestor() {
        let mut tree = TestTree::default();
        tree.add(1, None, None, screen(), false);
        tree.add(2, Some(1), Some("Card"), Rect::new(0.0, 0.0, 400.0, 100.0), true);
        tree.add(3, Some(2), Some("Title"), Rect::new(10.0, 10.0, 200.0, 20.0), true);
        tree.add(4, Some(2), Some("Subtitle"), Rect::new(10.0, 40.0, 200.0, 20.0), true);
        tree.add(5, Some(1), Some("Loose"), Rect::new(0.0, 200.0, 50.0, 50.0), true);

        let found = find(&tree, &Matcher::Type("View".to_string()));
        let ids: Vec<&str> = found.iter().map(|f| f.identifier.as_str()).collect();
        assert_eq!(ids, vec!["Card", "Loose"]);
    }

    #[test]
    fn test_find_drops_inaccessible_matches() {
        let mut tree = TestTree::default();
        tree.add(1, None, None, screen(), false);
        tree.add(2, Some(1), Some("Hidden"), screen(), false);

        assert!(find(&tree, &Matcher::Identifier("Hidden".to_string())).is_empty());
    }

    #[test]
    fn test_text_pattern_literal_flags() {
        let pattern = TextPattern::new("/^card \\d+$/i", true).unwrap();
        assert!(pattern.is_match("Card 12"));
        assert!(!pattern.is_match("Card twelve"));

        let bare = TextPattern::new("^Card", true).unwrap();
        assert!(bare.is_match("Card 1"));

        let exact = TextPattern::new("/^Card/", false).unwrap();
        assert!(!exact.is_match("Card"));
    }

    #[test]
    fn test_text_pattern_rejects_bad_regex() {
        let err = TextPattern::new("/(unclosed/", true).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_traits_require_accessibility() {
        let props = ElementProperties {
            identifier: Some("Go".to_string()),
            frame: screen(),
            text: None,
            class_names: Vec::new(),
            traits: vec![AccessibilityTrait::Button, AccessibilityTrait::Selected],
            is_accessibility_element: true,
        };

        let matcher = Matcher::Traits(vec![AccessibilityTrait::Button]);
        assert!(matcher.matches(&props));

        let inaccessible = ElementProperties {
            is_accessibility_element: false,
            ..props.clone()
        };
        assert!(!matcher.matches(&inaccessible));

        let missing = Matcher::Traits(vec![AccessibilityTrait::Button, AccessibilityTrait::Link]);
        assert!(!missing.matches(&props));
    }
}
