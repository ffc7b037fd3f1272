use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct PaginationParams {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}
fn default_limit() -> u32 {
    20
}

impl PaginationParams {
    pub fn offset(&self) -> i64 {
        (self.page.saturating_sub(1) as i64) * self.limit() as i64
    }

    pub fn limit(&self) -> u32 {
        self.limit.min(100)
    }
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self { page: 1, limit: 20 }
    }
}

/// Pagination metadata returned next to every paged collection.
///
/// `total_items` may reflect only the returned page where a full count is
/// prohibitively expensive (wide-column storage).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PaginationMeta {
    pub total_items: u32,
    pub item_count: u32,
    pub items_per_page: u32,
    pub total_pages: u32,
    pub current_page: u32,
}

impl PaginationMeta {
    pub fn new(total_items: u32, item_count: u32, items_per_page: u32, current_page: u32) -> Self {
        let total_pages = if items_per_page == 0 {
            0
        } else {
            total_items.div_ceil(items_per_page)
        };
        Self {
            total_items,
            item_count,
            items_per_page,
            total_pages,
            current_page,
        }
    }

    /// Meta for responses where only the page itself was counted.
    pub fn page_only(item_count: u32) -> Self {
        Self {
            total_items: item_count,
            item_count,
            items_per_page: 0,
            total_pages: 1,
            current_page: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_and_limit() {
        let params = PaginationParams { page: 3, limit: 25 };
        assert_eq!(params.offset(), 50);
        assert_eq!(params.limit(), 25);

        let capped = PaginationParams { page: 1, limit: 500 };
        assert_eq!(capped.limit(), 100);
    }

    #[test]
    fn meta_total_pages() {
        let meta = PaginationMeta::new(41, 20, 20, 1);
        assert_eq!(meta.total_pages, 3);

        let empty = PaginationMeta::new(0, 0, 20, 1);
        assert_eq!(empty.total_pages, 0);
    }
}
