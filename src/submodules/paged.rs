use super::SubmoduleDefinition;

/// A submodule made of numbered pages with ids `<prefix><n>`.
///
/// Covers tasks whose pages are a plain 1..=N sequence, and stands in for
/// real submodules in the CLI and tests.
#[derive(Debug, Clone)]
pub struct PagedSubmodule {
    id: String,
    display_name: String,
    page_prefix: String,
    total_pages: Option<u32>,
}

impl PagedSubmodule {
    pub const DEFAULT_PAGE_PREFIX: &'static str = "page-";

    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            page_prefix: Self::DEFAULT_PAGE_PREFIX.to_string(),
            total_pages: None,
        }
    }

    pub fn with_total_pages(mut self, total: u32) -> Self {
        self.total_pages = Some(total);
        self
    }

    pub fn with_page_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.page_prefix = prefix.into();
        self
    }
}

impl SubmoduleDefinition for PagedSubmodule {
    fn submodule_id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn initial_page(&self, page_num: &str) -> String {
        format!("{}{}", self.page_prefix, page_num)
    }

    fn resolve_page_num(&self, page_id: &str) -> Option<String> {
        page_id
            .strip_prefix(self.page_prefix.as_str())
            .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
            .map(str::to_string)
    }

    fn total_steps(&self) -> Option<u32> {
        self.total_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_ids_round_trip() {
        let module = PagedSubmodule::new("g7-experiment", "G7 Experiment").with_total_pages(8);
        assert_eq!(module.initial_page("3"), "page-3");
        assert_eq!(module.resolve_page_num("page-3").as_deref(), Some("3"));
        assert_eq!(module.total_steps(), Some(8));
    }

    #[test]
    fn test_unknown_page_ids() {
        let module = PagedSubmodule::new("q", "Questionnaire").with_page_prefix("Page_");
        assert_eq!(module.resolve_page_num("Page_").as_deref(), None);
        assert_eq!(module.resolve_page_num("Page_x").as_deref(), None);
        assert_eq!(module.resolve_page_num("page-1").as_deref(), None);
        assert_eq!(module.resolve_page_num("Page_12").as_deref(), Some("12"));
    }
}
