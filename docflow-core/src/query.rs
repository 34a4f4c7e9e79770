//! Declarative queries.
//!
//! A [`Query`] is a filter expression plus sort keys, paging and an optional
//! projection. [`Query::compile`] lowers it to the filter document and
//! [`FindOptions`] a plain `find` takes, so a query runs through the same
//! behavior chain as any other read.
//!
//! ```ignore
//! use docflow::query::{Filter, Query, SortDirection};
//!
//! let recent = Query::builder()
//!     .filter(Filter::eq("status", "published").and(Filter::gte("views", 10)))
//!     .sort("publishedAt", SortDirection::Desc)
//!     .limit(20)
//!     .build();
//!
//! let posts = collection.query(recent, &ctx).await?;
//! ```

use bson::{Bson, Document, doc};

use crate::{
    backend::FindOptions,
    error::{DocumentStoreError, DocumentStoreResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn as_bson(self) -> Bson {
        match self {
            SortDirection::Asc => Bson::Int32(1),
            SortDirection::Desc => Bson::Int32(-1),
        }
    }
}

/// One sort key. Keys are applied in the order they were added.
#[derive(Debug, Clone, PartialEq)]
pub struct Sort {
    pub field: String,
    pub direction: SortDirection,
}

/// Comparison applied by an [`Expr::Field`] clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Value is one of an array of candidates.
    In,
    /// Value is none of an array of candidates.
    NotIn,
    /// Case-insensitive substring match on a string field.
    Contains,
    /// Case-insensitive prefix match on a string field.
    StartsWith,
}

impl FieldOp {
    fn operator(self) -> &'static str {
        match self {
            FieldOp::Eq => "$eq",
            FieldOp::Ne => "$ne",
            FieldOp::Gt => "$gt",
            FieldOp::Gte => "$gte",
            FieldOp::Lt => "$lt",
            FieldOp::Lte => "$lte",
            FieldOp::In => "$in",
            FieldOp::NotIn => "$nin",
            FieldOp::Contains | FieldOp::StartsWith => "$regex",
        }
    }
}

/// A filter expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Exists(String, bool),
    Field { field: String, op: FieldOp, value: Bson },
}

impl Expr {
    pub fn field(field: impl Into<String>, op: FieldOp, value: impl Into<Bson>) -> Self {
        Expr::Field { field: field.into(), op, value: value.into() }
    }

    /// Conjunction. Chained calls flatten into a single `And`.
    pub fn and(self, other: Expr) -> Self {
        match self {
            Expr::And(mut clauses) => {
                clauses.push(other);
                Expr::And(clauses)
            }
            first => Expr::And(vec![first, other]),
        }
    }

    /// Disjunction. Chained calls flatten into a single `Or`.
    pub fn or(self, other: Expr) -> Self {
        match self {
            Expr::Or(mut clauses) => {
                clauses.push(other);
                Expr::Or(clauses)
            }
            first => Expr::Or(vec![first, other]),
        }
    }

    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }
}

/// Shorthand constructors for [`Expr`] clauses.
pub struct Filter;

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field, FieldOp::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field, FieldOp::Ne, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field, FieldOp::Gt, value)
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field, FieldOp::Gte, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field, FieldOp::Lt, value)
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field, FieldOp::Lte, value)
    }

    pub fn one_of<V: Into<Bson>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Expr {
        Expr::field(field, FieldOp::In, Bson::Array(values.into_iter().map(Into::into).collect()))
    }

    pub fn none_of<V: Into<Bson>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Expr {
        Expr::field(field, FieldOp::NotIn, Bson::Array(values.into_iter().map(Into::into).collect()))
    }

    pub fn contains(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field, FieldOp::Contains, value)
    }

    pub fn starts_with(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field, FieldOp::StartsWith, value)
    }

    pub fn exists(field: impl Into<String>) -> Expr {
        Expr::Exists(field.into(), true)
    }

    pub fn missing(field: impl Into<String>) -> Expr {
        Expr::Exists(field.into(), false)
    }

    pub fn all(clauses: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::And(clauses.into_iter().collect())
    }

    pub fn any(clauses: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Or(clauses.into_iter().collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filter: Option<Expr>,
    pub sort: Vec<Sort>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub projection: Option<Document>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> QueryBuilder {
        QueryBuilder::default()
    }

    /// Lowers the query into a filter document and find options.
    pub fn compile(&self) -> DocumentStoreResult<(Document, FindOptions)> {
        let filter = match &self.filter {
            Some(expr) => FilterCompiler.visit_expr(expr)?,
            None => Document::new(),
        };

        let sort = (!self.sort.is_empty()).then(|| {
            self.sort
                .iter()
                .map(|key| (key.field.clone(), key.direction.as_bson()))
                .collect::<Document>()
        });

        let options = FindOptions {
            sort,
            skip: self.offset,
            limit: self.limit,
            projection: self.projection.clone(),
        };

        Ok((filter, options))
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    query: Query,
}

impl QueryBuilder {
    /// Sets the filter. A second call replaces the first; combine with
    /// [`Expr::and`] instead.
    pub fn filter(mut self, filter: Expr) -> Self {
        self.query.filter = Some(filter);
        self
    }

    /// Appends a sort key.
    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.query.sort.push(Sort { field: field.into(), direction });
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.query.offset = Some(offset);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.query.limit = Some(limit);
        self
    }

    pub fn project(mut self, projection: Document) -> Self {
        self.query.projection = Some(projection);
        self
    }

    pub fn build(self) -> Query {
        self.query
    }
}

/// Walks an [`Expr`] tree.
pub trait QueryVisitor {
    type Output;

    fn visit_and(&mut self, clauses: &[Expr]) -> DocumentStoreResult<Self::Output>;
    fn visit_or(&mut self, clauses: &[Expr]) -> DocumentStoreResult<Self::Output>;
    fn visit_not(&mut self, inner: &Expr) -> DocumentStoreResult<Self::Output>;
    fn visit_exists(&mut self, field: &str, present: bool) -> DocumentStoreResult<Self::Output>;
    fn visit_field(&mut self, field: &str, op: FieldOp, value: &Bson) -> DocumentStoreResult<Self::Output>;

    fn visit_expr(&mut self, expr: &Expr) -> DocumentStoreResult<Self::Output> {
        match expr {
            Expr::And(clauses) => self.visit_and(clauses),
            Expr::Or(clauses) => self.visit_or(clauses),
            Expr::Not(inner) => self.visit_not(inner),
            Expr::Exists(field, present) => self.visit_exists(field, *present),
            Expr::Field { field, op, value } => self.visit_field(field, *op, value),
        }
    }
}

/// Lowers expressions to Mongo-style filter documents, the dialect every
/// backend evaluates.
pub struct FilterCompiler;

impl FilterCompiler {
    fn clauses(&mut self, clauses: &[Expr]) -> DocumentStoreResult<Vec<Document>> {
        clauses.iter().map(|clause| self.visit_expr(clause)).collect()
    }
}

impl QueryVisitor for FilterCompiler {
    type Output = Document;

    fn visit_and(&mut self, clauses: &[Expr]) -> DocumentStoreResult<Document> {
        Ok(doc! { "$and": self.clauses(clauses)? })
    }

    fn visit_or(&mut self, clauses: &[Expr]) -> DocumentStoreResult<Document> {
        Ok(doc! { "$or": self.clauses(clauses)? })
    }

    fn visit_not(&mut self, inner: &Expr) -> DocumentStoreResult<Document> {
        // `$not` only applies to a single field; `$nor` negates a whole clause.
        Ok(doc! { "$nor": [self.visit_expr(inner)?] })
    }

    fn visit_exists(&mut self, field: &str, present: bool) -> DocumentStoreResult<Document> {
        Ok(doc! { field: { "$exists": present } })
    }

    fn visit_field(&mut self, field: &str, op: FieldOp, value: &Bson) -> DocumentStoreResult<Document> {
        let condition = match (op, value) {
            (FieldOp::Contains, Bson::String(text)) => {
                doc! { "$regex": regex::escape(text), "$options": "i" }
            }
            (FieldOp::StartsWith, Bson::String(text)) => {
                doc! { "$regex": format!("^{}", regex::escape(text)), "$options": "i" }
            }
            (FieldOp::Contains | FieldOp::StartsWith, _) => {
                return Err(DocumentStoreError::InvalidDocument(format!(
                    "{} on {} needs a string value",
                    op.operator(),
                    field
                )));
            }
            (FieldOp::In | FieldOp::NotIn, Bson::Array(_)) => doc! { op.operator(): value.clone() },
            (FieldOp::In | FieldOp::NotIn, single) => doc! { op.operator(): [single.clone()] },
            (_, value) => doc! { op.operator(): value.clone() },
        };

        Ok(doc! { field: condition })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_query_matches_everything() {
        let (filter, options) = Query::new().compile().unwrap();

        assert!(filter.is_empty());
        assert_eq!(options, FindOptions::default());
    }

    #[test]
    fn test_compile_filter_sort_and_paging() {
        let query = Query::builder()
            .filter(Filter::eq("status", "active").and(Filter::gt("age", 18)))
            .sort("createdAt", SortDirection::Desc)
            .sort("name", SortDirection::Asc)
            .offset(20)
            .limit(10)
            .project(doc! { "name": 1 })
            .build();

        let (filter, options) = query.compile().unwrap();

        assert_eq!(
            filter,
            doc! { "$and": [
                { "status": { "$eq": "active" } },
                { "age": { "$gt": 18 } },
            ] }
        );
        assert_eq!(options.sort, Some(doc! { "createdAt": -1, "name": 1 }));
        assert_eq!(options.skip, Some(20));
        assert_eq!(options.limit, Some(10));
        assert_eq!(options.projection, Some(doc! { "name": 1 }));
    }

    #[test]
    fn test_not_lowers_to_nor() {
        let filter = FilterCompiler.visit_expr(&Filter::exists("deletedAt").not()).unwrap();

        assert_eq!(filter, doc! { "$nor": [{ "deletedAt": { "$exists": true } }] });
    }

    #[test]
    fn test_membership_wraps_single_values() {
        let listed = FilterCompiler.visit_expr(&Filter::one_of("role", ["admin", "owner"])).unwrap();
        let single = FilterCompiler.visit_expr(&Expr::field("role", FieldOp::NotIn, "guest")).unwrap();

        assert_eq!(listed, doc! { "role": { "$in": ["admin", "owner"] } });
        assert_eq!(single, doc! { "role": { "$nin": ["guest"] } });
    }

    #[test]
    fn test_text_matches_escape_patterns() {
        let filter = FilterCompiler.visit_expr(&Filter::starts_with("name", "a.b")).unwrap();

        assert_eq!(filter, doc! { "name": { "$regex": "^a\\.b", "$options": "i" } });
        assert!(FilterCompiler.visit_expr(&Filter::contains("n", 1)).is_err());
    }
}
