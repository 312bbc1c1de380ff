use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[macro_export]
macro_rules! invalid_input {
    ($($token:tt)*) => {
        return Err($crate::error::Error::invalid_input(vec![format!($($token)*)]))
    };
}

#[macro_export]
macro_rules! not_found {
    ($($token:tt)*) => {
        return Err($crate::error::Error::not_found(anyhow::anyhow!($($token)*)))
    };
}

#[macro_export]
macro_rules! not_supported {
    ($($token:tt)*) => {
        return Err($crate::error::Error::not_supported(anyhow::anyhow!($($token)*)))
    };
}

#[macro_export]
macro_rules! internal {
    ($($token:tt)*) => {
        return Err($crate::error::Error::internal(anyhow::anyhow!($($token)*)))
    };
}

/// The error surface of the engine.
///
/// `kind` is the stable taxonomy; `inner` carries the human-readable cause
/// chain. The optional fields are populated where they are known: `model` by
/// the operation handlers, `sql`/`sql_params` by the executor.
#[derive(Debug)]
pub struct Error {
    pub inner: anyhow::Error,
    pub kind: ErrorKind,
    pub model: Option<String>,
    pub sql: Option<String>,
    pub sql_params: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid client configuration.
    Config,
    /// Validation failure; one message per violated constraint.
    InvalidInput { messages: Vec<String> },
    /// `*OrThrow` misses and policy-masked reads that resolve to nothing.
    NotFound,
    RejectedByPolicy { reason: RejectReason },
    /// Wraps a driver error; `db_error_code` is the provider-specific code
    /// (e.g. `SQLITE_CONSTRAINT_UNIQUE`, `23505`, `ER_DUP_ENTRY`).
    DbQuery { db_error_code: Option<String> },
    /// Feature not available on the chosen provider.
    NotSupported,
    /// Invariant violation.
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NoAccess,
    CannotReadBack,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoAccess => "no access",
            Self::CannotReadBack => "result is not readable",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let context = match &self.kind {
            ErrorKind::Config => "configuration error",
            ErrorKind::InvalidInput { .. } => "invalid input",
            ErrorKind::NotFound => "not found",
            ErrorKind::RejectedByPolicy { .. } => "rejected by policy",
            ErrorKind::DbQuery { .. } => "database error",
            ErrorKind::NotSupported => "not supported",
            ErrorKind::Internal => "internal error",
        };
        write!(f, "{context}: {}", self.inner)
    }
}

impl std::error::Error for Error {}

impl Error {
    fn new(inner: anyhow::Error, kind: ErrorKind) -> Self {
        Self {
            inner,
            kind,
            model: None,
            sql: None,
            sql_params: None,
        }
    }

    pub fn config(inner: anyhow::Error) -> Self {
        Self::new(inner, ErrorKind::Config)
    }

    pub fn invalid_input(messages: Vec<String>) -> Self {
        let inner = anyhow::anyhow!("{}", messages.join("; "));
        Self::new(inner, ErrorKind::InvalidInput { messages })
    }

    pub fn not_found(inner: anyhow::Error) -> Self {
        Self::new(inner, ErrorKind::NotFound)
    }

    pub fn rejected_by_policy(reason: RejectReason, model: &str) -> Self {
        let inner = anyhow::anyhow!(
            "operation on model `{model}` rejected by policy: {}",
            reason.as_str()
        );
        let mut err = Self::new(inner, ErrorKind::RejectedByPolicy { reason });
        err.model = Some(model.to_owned());
        err
    }

    pub fn db_query(inner: anyhow::Error, db_error_code: Option<String>) -> Self {
        Self::new(inner, ErrorKind::DbQuery { db_error_code })
    }

    pub fn not_supported(inner: anyhow::Error) -> Self {
        Self::new(inner, ErrorKind::NotSupported)
    }

    pub fn internal(inner: anyhow::Error) -> Self {
        Self::new(inner, ErrorKind::Internal)
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model.get_or_insert_with(|| model.to_owned());
        self
    }

    pub fn with_sql(mut self, sql: &str, params: Vec<String>) -> Self {
        self.sql = Some(sql.to_owned());
        self.sql_params = Some(params);
        self
    }

    /// The provider-specific database error code, when this is a
    /// [`ErrorKind::DbQuery`].
    pub fn db_error_code(&self) -> Option<&str> {
        match &self.kind {
            ErrorKind::DbQuery { db_error_code } => db_error_code.as_deref(),
            _ => None,
        }
    }

    pub fn rejection_reason(&self) -> Option<RejectReason> {
        match &self.kind {
            ErrorKind::RejectedByPolicy { reason } => Some(*reason),
            _ => None,
        }
    }
}

pub trait ResultExt<T> {
    fn err_internal(self) -> Result<T>;
    fn err_invalid_input(self) -> Result<T>;
    fn err_config(self) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn err_internal(self) -> Result<T> {
        self.map_err(|e| Error::internal(e.into()))
    }

    fn err_invalid_input(self) -> Result<T> {
        self.map_err(|e| {
            let e: anyhow::Error = e.into();
            Error::invalid_input(vec![format!("{e:#}")])
        })
    }

    fn err_config(self) -> Result<T> {
        self.map_err(|e| Error::config(e.into()))
    }
}
