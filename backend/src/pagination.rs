//! Pagination and query helpers for the Triage API
//!
//! Provides standardized pagination, sorting, and dynamic filtering across
//! all list endpoints.

use serde::{Deserialize, Serialize};

/// Default page size if not specified
pub const DEFAULT_PAGE_SIZE: i64 = 20;
/// Maximum allowed page size
pub const MAX_PAGE_SIZE: i64 = 100;
/// Default page number (1-indexed for API consumers)
pub const DEFAULT_PAGE: i64 = 1;

/// Standard pagination query parameters
#[derive(Debug, Clone, Deserialize)]
pub struct PaginationParams {
    /// Page number (1-indexed)
    #[serde(default = "default_page")]
    pub page: i64,
    /// Number of items per page
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Sort field
    pub sort_by: Option<String>,
    /// Sort direction (asc/desc)
    #[serde(default = "default_sort_order")]
    pub sort_order: String,
}

fn default_page() -> i64 {
    DEFAULT_PAGE
}

fn default_limit() -> i64 {
    DEFAULT_PAGE_SIZE
}

fn default_sort_order() -> String {
    "desc".to_string()
}

impl PaginationParams {
    /// Get SQL OFFSET value
    pub fn offset(&self) -> i64 {
        let page = self.page.max(1);
        (page - 1) * self.limit()
    }

    /// Get SQL LIMIT value
    pub fn limit(&self) -> i64 {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }

    /// Get sort direction as SQL string
    pub fn sort_direction(&self) -> &str {
        if self.sort_order.to_lowercase() == "asc" {
            "ASC"
        } else {
            "DESC"
        }
    }

    /// Validate and sanitize sort field against allowed fields
    pub fn validated_sort_field(&self, allowed: &[&str], default: &str) -> String {
        self.sort_by
            .as_ref()
            .filter(|s| allowed.contains(&s.as_str()))
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            limit: DEFAULT_PAGE_SIZE,
            sort_by: None,
            sort_order: "desc".to_string(),
        }
    }
}

/// Pagination metadata returned with list responses
#[derive(Debug, Clone, Serialize)]
pub struct PaginationMeta {
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub total_pages: i64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl PaginationMeta {
    pub fn new(page: i64, limit: i64, total: i64) -> Self {
        let total_pages = (total as f64 / limit as f64).ceil() as i64;
        Self {
            page,
            limit,
            total,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        }
    }
}

/// Standard paginated response wrapper
#[derive(Debug, Clone, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub meta: PaginationMeta,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, params: &PaginationParams, total: i64) -> Self {
        Self {
            data,
            meta: PaginationMeta::new(params.page.max(1), params.limit(), total),
        }
    }
}

/// SQL query builder helper for dynamic filtering
#[derive(Debug, Default)]
pub struct QueryBuilder {
    conditions: Vec<String>,
    param_count: usize,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start parameter numbering from a specific index
    pub fn with_start_param(start: usize) -> Self {
        Self {
            conditions: Vec::new(),
            param_count: start,
        }
    }

    /// Add a condition (returns the parameter placeholder number)
    pub fn add_condition(&mut self, condition: &str) -> usize {
        self.param_count += 1;
        let full_condition = condition.replace("{}", &format!("${}", self.param_count));
        self.conditions.push(full_condition);
        self.param_count
    }

    /// Add a fixed predicate that binds no parameter
    pub fn add_static(&mut self, condition: &str) {
        self.conditions.push(condition.to_string());
    }

    /// Get the WHERE clause (empty string if no conditions)
    pub fn where_clause(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.conditions.join(" AND "))
        }
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_offset() {
        let params = PaginationParams {
            page: 3,
            limit: 20,
            ..Default::default()
        };
        assert_eq!(params.offset(), 40);
        assert_eq!(params.limit(), 20);
    }

    #[test]
    fn test_pagination_clamps() {
        let params = PaginationParams {
            page: -1,
            limit: 500,
            ..Default::default()
        };
        assert_eq!(params.offset(), 0); // page clamped to 1
        assert_eq!(params.limit(), MAX_PAGE_SIZE);
    }

    #[test]
    fn test_pagination_meta() {
        let meta = PaginationMeta::new(2, 20, 100);
        assert_eq!(meta.total_pages, 5);
        assert!(meta.has_next);
        assert!(meta.has_prev);
    }

    #[test]
    fn test_query_builder() {
        let mut qb = QueryBuilder::new();
        qb.add_condition("status = {}");
        qb.add_condition("assigned_to = {}");
        qb.add_static("deleted_at IS NULL");

        assert_eq!(
            qb.where_clause(),
            "WHERE status = $1 AND assigned_to = $2 AND deleted_at IS NULL"
        );
        assert_eq!(qb.param_count(), 2);
    }

    #[test]
    fn test_sort_field_whitelist() {
        let params = PaginationParams {
            sort_by: Some("priority; DROP TABLE tickets".to_string()),
            ..Default::default()
        };
        assert_eq!(
            params.validated_sort_field(&["created_at", "priority"], "created_at"),
            "created_at"
        );
    }
}
