use scraper::{Html, Selector};

/// An element matched by [`Response::html_query`](crate::Response::html_query).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlElement {
    /// Lowercase tag name.
    pub name: String,
    /// Attributes in document order.
    pub attributes: Vec<(String, String)>,
    /// Concatenated text of all descendant text nodes.
    pub text: String,
    /// Outer HTML of the element.
    pub html: String,
}

impl HtmlElement {
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Match `selector` (CSS) against `document`. An invalid selector matches nothing.
pub(crate) fn select(document: &str, selector: &str) -> Vec<HtmlElement> {
    let parsed = match Selector::parse(selector) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!(selector, error = %e, "invalid html selector");
            return Vec::new();
        }
    };

    Html::parse_document(document)
        .select(&parsed)
        .map(|element| HtmlElement {
            name: element.value().name().to_owned(),
            attributes: element
                .value()
                .attrs()
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                .collect(),
            text: element.text().collect(),
            html: element.html(),
        })
        .collect()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><body>
        <ul id="releases">
            <li class="stable" data-version="1.2"><a href="/v1.2">Stable <b>1.2</b></a></li>
            <li class="beta"><a href="/v2.0">Beta</a></li>
        </ul>
    </body></html>"#;

    #[test]
    fn test_select_by_class() {
        let found = select(PAGE, "li.stable");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "li");
        assert_eq!(found[0].text, "Stable 1.2");
        assert_eq!(found[0].attribute("data-version"), Some("1.2"));
        assert!(found[0].html.starts_with("<li"));
    }

    #[test]
    fn test_select_keeps_document_order() {
        let hrefs: Vec<_> = select(PAGE, "#releases a")
            .iter()
            .filter_map(|a| a.attribute("href").map(ToOwned::to_owned))
            .collect();
        assert_eq!(hrefs, vec!["/v1.2", "/v2.0"]);
    }

    #[test]
    fn test_invalid_selector_matches_nothing() {
        assert!(select(PAGE, "li[").is_empty());
        assert!(select("not html at all", "li").is_empty());
    }
}
