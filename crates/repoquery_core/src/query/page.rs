//! Page requests, sort orders and result pages.
//!
//! # Invariants
//! - Page numbers are zero-based.
//! - `Page::total_pages()` is `ceil(total_elements / size)` and is zero only
//!   when there are no elements.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// One sort key on a logical property (or a native result label).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub property: String,
    pub direction: Direction,
}

impl Order {
    pub fn asc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: Direction::Desc,
        }
    }
}

/// Ordered list of sort keys; earlier keys take precedence.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Sort {
    orders: Vec<Order>,
}

impl Sort {
    pub fn unsorted() -> Self {
        Self::default()
    }

    pub fn by(order: Order) -> Self {
        Self {
            orders: vec![order],
        }
    }

    pub fn asc(property: impl Into<String>) -> Self {
        Self::by(Order::asc(property))
    }

    pub fn desc(property: impl Into<String>) -> Self {
        Self::by(Order::desc(property))
    }

    pub fn and(mut self, order: Order) -> Self {
        self.orders.push(order);
        self
    }

    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    pub fn is_unsorted(&self) -> bool {
        self.orders.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
    pub sort: Sort,
}

impl PageRequest {
    /// Zero-based page of `size` rows. A zero size is raised to one.
    pub fn of(page: u32, size: u32) -> Self {
        Self {
            page,
            size: size.max(1),
            sort: Sort::unsorted(),
        }
    }

    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.size)
    }

    /// Caps the size at the configured maximum.
    pub(crate) fn clamped(&self, max_page_size: u32) -> Self {
        Self {
            page: self.page,
            size: self.size.clamp(1, max_page_size.max(1)),
            sort: self.sort.clone(),
        }
    }

    pub fn next(&self) -> Self {
        Self {
            page: self.page.saturating_add(1),
            size: self.size,
            sort: self.sort.clone(),
        }
    }
}

/// A slice of results plus the total count of the unpaged query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub content: Vec<T>,
    pub number: u32,
    pub size: u32,
    pub total_elements: u64,
}

impl<T> Page<T> {
    pub fn new(content: Vec<T>, request: &PageRequest, total_elements: u64) -> Self {
        Self {
            content,
            number: request.page,
            size: request.size,
            total_elements,
        }
    }

    pub fn content(&self) -> &[T] {
        &self.content
    }

    pub fn total_pages(&self) -> u64 {
        if self.size == 0 {
            return 0;
        }
        self.total_elements.div_ceil(u64::from(self.size))
    }

    pub fn is_first(&self) -> bool {
        self.number == 0
    }

    pub fn has_previous(&self) -> bool {
        self.number > 0
    }

    pub fn has_next(&self) -> bool {
        (u64::from(self.number) + 1) * u64::from(self.size) < self.total_elements
    }

    pub fn is_last(&self) -> bool {
        !self.has_next()
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            content: self.content.into_iter().map(f).collect(),
            number: self.number,
            size: self.size,
            total_elements: self.total_elements,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Page, PageRequest, Sort};

    #[test]
    fn five_rows_in_pages_of_three() {
        let request = PageRequest::of(0, 3).with_sort(Sort::desc("username"));
        let first = Page::new(vec![1, 2, 3], &request, 5);
        assert_eq!(first.total_pages(), 2);
        assert!(first.is_first());
        assert!(first.has_next());
        assert!(!first.is_last());

        let second = Page::new(vec![4, 5], &request.next(), 5);
        assert!(!second.has_next());
        assert!(second.is_last());
        assert!(second.has_previous());
    }

    #[test]
    fn empty_result_has_no_pages() {
        let page: Page<i32> = Page::new(Vec::new(), &PageRequest::of(0, 10), 0);
        assert_eq!(page.total_pages(), 0);
        assert!(page.is_last());
    }

    #[test]
    fn size_is_clamped() {
        assert_eq!(PageRequest::of(0, 0).size, 1);
        assert_eq!(PageRequest::of(2, 5000).clamped(2000).size, 2000);
        assert_eq!(PageRequest::of(2, 10).offset(), 20);
    }
}
