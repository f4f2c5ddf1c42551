use std::error::Error as StdError;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    ExternalToolError,
    EmptyGeometry,
    ForeignError,
    InconsistentState,
    InvalidParams,
    IoError,
    MalformedData,
    NoUsableViews,
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub description: String,
    pub source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind, description: String) -> Self {
        Self {
            kind,
            description,
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        description: String,
        source: Box<dyn StdError + Send + Sync>,
    ) -> Self {
        Self {
            kind,
            description,
            source: Some(source),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.description)?;
        if let Some(source) = &self.source {
            write!(f, " ({})", source)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn StdError + 'static))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait IntoResult<T> {
    fn into_result<F: FnOnce() -> String>(self, desc: F) -> Result<T>;

    fn res<F: FnOnce() -> String>(self, desc: F) -> Result<T>
    where
        Self: Sized,
    {
        self.into_result(desc)
    }
}

impl<T, E: StdError + Send + Sync + 'static> IntoResult<T>
    for std::result::Result<T, E>
{
    fn into_result<F: FnOnce() -> String>(self, desc: F) -> Result<T> {
        self.map_err(|err| {
            let boxed: Box<dyn StdError + Send + Sync> = Box::new(err);
            let kind = if boxed.is::<std::io::Error>() {
                ErrorKind::IoError
            } else {
                ErrorKind::ForeignError
            };
            Error::with_source(kind, desc(), boxed)
        })
    }
}
