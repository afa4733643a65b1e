//! Flattening of the HTML fragments providers embed in titles and descriptions.

use scraper::{ElementRef, Html};

/// Elements whose text never belongs in a listing.
const SKIPPED_TAGS: [&str; 7] = [
    "script", "style", "noscript", "iframe", "svg", "template", "head",
];

/// Plain text of an HTML fragment with entities decoded once and
/// whitespace collapsed.
pub fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    element_text(fragment.root_element())
}

/// Text of each non-empty `<li>` element, in document order.
pub fn list_items(html: &str) -> Vec<String> {
    let fragment = Html::parse_fragment(html);
    fragment
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "li")
        .map(element_text)
        .filter(|item| !item.is_empty())
        .collect()
}

fn element_text(element: ElementRef<'_>) -> String {
    let mut words: Vec<&str> = Vec::new();
    for node in element.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let skipped = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|el| SKIPPED_TAGS.contains(&el.name()))
        });
        if !skipped {
            words.extend(text.split_whitespace());
        }
    }
    words.join(" ")
}
