use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or illegal input.
    Validation(&'static str),
    /// Overlaps an existing period or reservation.
    Conflict(Ulid),
    /// `actor` does not own `resource`.
    Unauthorized { resource: Ulid, actor: Ulid },
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Mutation blocked by dependent state.
    BusinessRule { id: Ulid, reason: &'static str },
    LimitExceeded(&'static str),
    Persistence(String),
}

impl EngineError {
    /// SQLSTATE reported to pgwire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "22023",
            EngineError::Conflict(_) => "23P01",
            EngineError::Unauthorized { .. } => "42501",
            EngineError::NotFound(_) => "P0002",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::BusinessRule { .. } => "55000",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::Persistence(_) => "58030",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::Conflict(id) => write!(f, "overlaps existing entry: {id}"),
            EngineError::Unauthorized { resource, actor } => {
                write!(f, "{actor} is not the owner of {resource}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::BusinessRule { id, reason } => write!(f, "{id}: {reason}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Persistence(e) => write!(f, "persistence error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
