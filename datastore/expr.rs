/// A filter expression, compiled from `where` arguments or access policies
/// and rendered into SQL by the query planner.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal expression.
    Value { value: Literal },
    /// A reference to a field of the filter parameter, possibly through a
    /// chain of to-one relations (e.g. `post.author.name`).
    Property(PropertyAccess),
    /// The filter-predicate's single parameter, i.e. the row being tested.
    Parameter { position: usize },
    /// A binary expression.
    Binary(BinaryExpr),
    Not(Box<Expr>),
    /// `expr IS [NOT] NULL`.
    IsNull { expr: Box<Expr>, negated: bool },
    /// `expr IN (v1, v2, ...)`.
    In {
        expr: Box<Expr>,
        list: Vec<Literal>,
        negated: bool,
    },
    /// Correlated existence test against a relation of the current row.
    Exists(Box<RelationTest>),
    /// A membership/emptiness test on a JSON-encoded scalar list column.
    ListTest(Box<ListTest>),
    /// A test on a value inside a JSON column, addressed by path.
    JsonTest(Box<JsonTest>),
    /// A raw SQL fragment, already qualified against the right alias. Used
    /// for computed fields.
    Sql(String),
}

impl Expr {
    pub fn not(expr: Expr) -> Expr {
        Expr::Not(Box::new(expr))
    }

    pub fn is_null(expr: Expr, negated: bool) -> Expr {
        Expr::IsNull { expr: Box::new(expr), negated }
    }

    /// The constant `true`/`false` predicates.
    pub fn constant(value: bool) -> Expr {
        Literal::Bool(value).into()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyAccess {
    /// Name of the property to access.
    pub property: String,
    /// Expression whose property is accessed; a `Parameter` or another
    /// `Property`.
    pub object: Box<Expr>,
}

impl PropertyAccess {
    /// Builds the access chain `names[0].names[1]...` rooted at the filter
    /// parameter.
    pub fn chain(names: &[String]) -> Expr {
        let mut expr = Expr::Parameter { position: 0 };
        for name in names {
            expr = Expr::Property(PropertyAccess {
                property: name.clone(),
                object: Box::new(expr),
            });
        }
        expr
    }
}

/// Existence test: does a related row matching `filter` exist?
#[derive(Debug, Clone, PartialEq)]
pub struct RelationTest {
    /// Name of the relation field on the current model.
    pub relation: String,
    /// Filter applied to the related rows, if any.
    pub filter: Option<Expr>,
    /// `none` filters negate the whole EXISTS.
    pub negated: bool,
    /// `every` filters test that no related row violates the filter.
    pub all: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListTestKind {
    /// `has`: the list contains the single given value.
    Has,
    /// `hasSome`: the list contains at least one of the given values.
    HasSome,
    /// `hasEvery`: the list contains all of the given values.
    HasEvery,
    /// `isEmpty`.
    IsEmpty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListTest {
    /// Field holding the JSON-encoded scalar list.
    pub property: String,
    pub kind: ListTestKind,
    pub values: Vec<Literal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonTest {
    /// Field holding the JSON column.
    pub property: String,
    /// Path inside the JSON value (`["a", "b"]` addresses `$.a.b`). Empty
    /// means the whole column.
    pub path: Vec<String>,
    pub op: JsonTestOp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JsonTestOp {
    /// Equality against a JSON value, compared on canonical text.
    Equals(serde_json::Value),
    NotEquals(serde_json::Value),
    /// Column IS NULL (the SQL null).
    IsDbNull,
    /// Column holds the JSON literal `null`.
    IsJsonNull,
    /// Either of the above.
    IsAnyNull,
    /// A JSON array at `path` contains the given element.
    ArrayContains(serde_json::Value),
}

/// Various literals.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Bool(bool),
    U64(u64),
    I64(i64),
    F64(f64),
    String(String),
    Null,
}

impl From<bool> for Literal {
    fn from(val: bool) -> Self {
        Literal::Bool(val)
    }
}

impl From<u64> for Literal {
    fn from(val: u64) -> Self {
        Literal::U64(val)
    }
}

impl From<i64> for Literal {
    fn from(val: i64) -> Self {
        Literal::I64(val)
    }
}

impl From<f64> for Literal {
    fn from(val: f64) -> Self {
        Literal::F64(val)
    }
}

impl From<&str> for Literal {
    fn from(val: &str) -> Self {
        Literal::String(val.to_owned())
    }
}

impl From<String> for Literal {
    fn from(val: String) -> Self {
        Literal::String(val)
    }
}

impl From<Literal> for Expr {
    fn from(value: Literal) -> Self {
        Expr::Value { value }
    }
}

impl From<BinaryExpr> for Expr {
    fn from(expr: BinaryExpr) -> Self {
        Expr::Binary(expr)
    }
}

impl From<PropertyAccess> for Expr {
    fn from(prop: PropertyAccess) -> Self {
        Expr::Property(prop)
    }
}

/// A binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Like,
    NotLike,
    /// Case-insensitive LIKE; rendered as `LOWER(x) LIKE LOWER(y)` so it is
    /// portable across providers.
    ILike,
    NotILike,
}

impl BinaryOp {
    pub fn to_sql_string(&self) -> &str {
        match &self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Like | Self::ILike => "LIKE",
            Self::NotLike | Self::NotILike => "NOT LIKE",
        }
    }

    pub fn is_case_insensitive(&self) -> bool {
        matches!(self, Self::ILike | Self::NotILike)
    }
}

/// A binary expression.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpr {
    pub left: Box<Expr>,
    pub op: BinaryOp,
    pub right: Box<Expr>,
}

impl BinaryExpr {
    pub fn new(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Self {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Expr {
        Self::new(BinaryOp::Eq, left, right).into()
    }

    pub fn and(left: Expr, right: Expr) -> Expr {
        Self::new(BinaryOp::And, left, right).into()
    }

    pub fn or(left: Expr, right: Expr) -> Expr {
        Self::new(BinaryOp::Or, left, right).into()
    }
}

/// Folds `exprs` into a conjunction; `None` means no restriction.
pub fn and_all(exprs: impl IntoIterator<Item = Expr>) -> Option<Expr> {
    exprs.into_iter().reduce(BinaryExpr::and)
}

/// Folds `exprs` into a disjunction.
pub fn or_all(exprs: impl IntoIterator<Item = Expr>) -> Option<Expr> {
    exprs.into_iter().reduce(BinaryExpr::or)
}
