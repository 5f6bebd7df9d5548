//! Error types for spec loading, type resolution, building and constructing.
//!
//! Each concern has its own error enum; [`Error`] wraps all of them and
//! classifies failures through [`ErrorKind`].

use thiserror::Error;

/// Coarse classification of every failure the crate can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or inconsistent specification.
    SpecValidation,
    /// A type or namespace could not be found.
    TypeResolution,
    /// A namespace with the same name and version but different content.
    DuplicateNamespace,
    /// A value cannot be coerced to the dtype its spec requires.
    Conversion,
    /// A link or reference points at a container outside the graph being built.
    OrphanContainerBuild,
    /// A builder already attached elsewhere was attached again.
    OrphanBuilder,
    /// A builder could not be turned into a container.
    Construct,
    /// A container bound to one source was written to another.
    AlreadyWritten,
    /// Invalid class or mapper registration.
    TypeMap,
    /// Invalid container operation.
    Container,
    /// Builder tree misuse other than orphaning.
    Builder,
    /// Storage backend failure.
    Backend,
    /// Configuration could not be loaded.
    Config,
}

impl ErrorKind {
    /// Returns the short name of this kind (e.g., "ConversionError").
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::SpecValidation => "SpecValidationError",
            ErrorKind::TypeResolution => "TypeResolutionError",
            ErrorKind::DuplicateNamespace => "DuplicateNamespaceError",
            ErrorKind::Conversion => "ConversionError",
            ErrorKind::OrphanContainerBuild => "OrphanContainerBuildError",
            ErrorKind::OrphanBuilder => "OrphanBuilderError",
            ErrorKind::Construct => "ConstructError",
            ErrorKind::AlreadyWritten => "AlreadyWrittenError",
            ErrorKind::TypeMap => "TypeMapError",
            ErrorKind::Container => "ContainerError",
            ErrorKind::Builder => "BuilderError",
            ErrorKind::Backend => "BackendError",
            ErrorKind::Config => "ConfigError",
        }
    }
}

/// Error raised while parsing a spec from its mapping form.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpecError {
    #[error("{path}: expected a mapping")]
    NotAMapping { path: String },

    #[error("{path}: missing required key '{key}'")]
    MissingKey { path: String, key: &'static str },

    #[error("{path}: key '{key}' has an invalid value: {reason}")]
    InvalidValue {
        path: String,
        key: &'static str,
        reason: String,
    },

    #[error("{path}: unknown dtype '{dtype}'")]
    UnknownDtype { path: String, dtype: String },

    #[error("{path}: invalid quantity {quantity}")]
    InvalidQuantity { path: String, quantity: String },

    #[error("{path}: an untyped {kind} must have a name")]
    UnnamedUntyped { path: String, kind: &'static str },

    #[error("{path}: data_type_def and data_type_inc are both '{name}'")]
    SelfInclusion { path: String, name: String },

    #[error("{path}: both 'value' and 'default_value' are set")]
    ValueAndDefault { path: String },

    #[error("{path}: duplicate child name '{name}'")]
    DuplicateName { path: String, name: String },

    #[error("{path}: dims has {dims} entries but shape has {shape}")]
    DimsShapeMismatch {
        path: String,
        dims: usize,
        shape: usize,
    },

    #[error("invalid namespace name '{name}'")]
    InvalidNamespaceName { name: String },
}

/// Error raised by the namespace catalog.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("namespace '{name}' version {version:?} is already registered with different content")]
    DuplicateNamespace {
        name: String,
        version: Option<String>,
    },

    #[error("namespace '{namespace}' is not registered")]
    NamespaceNotFound { namespace: String },

    #[error("namespace '{namespace}' depends on unregistered namespace '{dependency}'")]
    UnresolvedDependency {
        namespace: String,
        dependency: String,
    },

    #[error("type '{data_type}' does not exist in namespace '{namespace}'")]
    TypeDoesNotExist {
        namespace: String,
        data_type: String,
    },

    #[error("type '{data_type}' is defined twice in namespace '{namespace}'")]
    DuplicateType {
        namespace: String,
        data_type: String,
    },

    #[error("inheritance cycle through '{data_type}' in namespace '{namespace}'")]
    InheritanceCycle {
        namespace: String,
        data_type: String,
    },
}

/// Error raised when a value cannot be made to fit a spec dtype.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConversionError {
    #[error("{path}: cannot convert {from} to {to}")]
    Incompatible {
        path: String,
        from: String,
        to: String,
    },

    #[error("{path}: value {value} does not fit in {to}")]
    OutOfRange {
        path: String,
        value: String,
        to: &'static str,
    },

    #[error("{path}: narrowing {value} to {to} is not allowed")]
    Narrowing {
        path: String,
        value: String,
        to: &'static str,
    },

    #[error("{path}: compound row has {actual} fields, expected {expected}")]
    CompoundArity {
        path: String,
        expected: usize,
        actual: usize,
    },

    #[error("{path}: expected a reference value")]
    ExpectedReference { path: String },

    #[error("{path}: invalid isodatetime {value:?}: {message}")]
    InvalidDatetime {
        path: String,
        value: String,
        message: String,
    },

    #[error("{path}: shape {actual:?} does not match {expected:?}")]
    ShapeMismatch {
        path: String,
        expected: Vec<Option<u64>>,
        actual: Vec<usize>,
    },

    #[error("{path}: malformed ragged index: {reason}")]
    RaggedIndex { path: String, reason: String },
}

/// Error raised by container operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContainerError {
    #[error("container name '{name}' must not contain '/'")]
    InvalidName { name: String },

    #[error("'{child}' already has parent '{parent}'")]
    ParentAlreadySet { child: String, parent: String },

    #[error("making '{parent}' the parent of '{child}' would create a cycle")]
    ParentCycle { child: String, parent: String },

    #[error("'{container}' ({data_type}) is missing required field '{field}'")]
    MissingRequiredField {
        container: String,
        data_type: String,
        field: String,
    },

    #[error("'{container}' ({data_type}) has no field '{field}'")]
    UnknownField {
        container: String,
        data_type: String,
        field: String,
    },

    #[error("field '{field}' of '{container}' expects {expected}")]
    FieldKindMismatch {
        container: String,
        field: String,
        expected: String,
    },

    #[error("{data_type} containers carry data; use create_data")]
    DataRequired { data_type: String },

    #[error("validation of '{container}' failed: {message}")]
    Rejected { container: String, message: String },

    #[error("unknown container handle")]
    NotFound,
}

/// Error raised by builder tree operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuilderError {
    #[error("builder '{child}' already has parent '{existing}', cannot attach it to '{parent}'")]
    OrphanBuilder {
        child: String,
        parent: String,
        existing: String,
    },

    #[error("'{parent}' already contains a different builder named '{name}'")]
    NameCollision { parent: String, name: String },

    #[error("'{path}' is not a group")]
    NotAGroup { path: String },

    #[error("links cannot carry attributes ('{path}')")]
    AttributeOnLink { path: String },

    #[error("unknown builder handle #{index}")]
    NotFound { index: usize },
}

/// Error raised by the type map while registering classes or mappers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TypeMapError {
    #[error("'{data_type}' is a {spec_kind} type, cannot map it to a {class_kind} class")]
    KindMismatch {
        data_type: String,
        spec_kind: &'static str,
        class_kind: &'static str,
    },

    #[error("class for '{data_type}' is already in use, register mappers before first use")]
    AlreadyMaterialized { data_type: String },
}

/// Error raised when a container would be written to a second destination.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AlreadyWrittenError {
    #[error("cannot change container_source of '{container}' from '{existing}' to '{requested}'")]
    SourceMismatch {
        container: String,
        existing: String,
        requested: String,
    },

    #[error("'{container}' was never read from a source, only read containers can be exported")]
    NeverRead { container: String },

    #[error("'{container}' is not the root of the file it was read from")]
    NotRoot { container: String },
}

/// Error raised by a storage backend.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("I/O error on '{source_name}': {message}")]
    Io {
        source_name: String,
        message: String,
    },

    #[error("malformed JSON in '{source_name}': {message}")]
    Json {
        source_name: String,
        message: String,
    },

    #[error("zstd failure: {0}")]
    Compression(String),

    #[error("'{source_name}' has nothing to read")]
    Empty { source_name: String },

    #[error("path '{path}' does not resolve in '{source_name}'")]
    UnresolvedPath { source_name: String, path: String },

    #[error("'{path}' references an object outside the file being written")]
    ExternalReference { path: String },
}

/// Error raised while loading configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("cannot read config '{path}': {message}")]
    Io { path: String, message: String },

    #[error("invalid config: {0}")]
    Parse(String),

    #[error("unknown dtype '{0}' in conversion rule")]
    UnknownDtype(String),
}

/// A finding reported by the builder tree validator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{path}: missing required attribute '{name}'")]
    MissingAttribute { path: String, name: String },

    #[error("{path}: missing required dataset '{name}'")]
    MissingDataset { path: String, name: String },

    #[error("{path}: missing required group '{name}'")]
    MissingGroup { path: String, name: String },

    #[error("{path}: expected {expected}, found {found}")]
    DtypeMismatch {
        path: String,
        expected: String,
        found: String,
    },

    #[error("{path}: shape {found:?} does not match {expected:?}")]
    ShapeMismatch {
        path: String,
        expected: Vec<Option<u64>>,
        found: Vec<usize>,
    },

    #[error("{path}: expected {expected} of {data_type}, found {found}")]
    QuantityMismatch {
        path: String,
        data_type: String,
        expected: String,
        found: usize,
    },

    #[error("{path}: unknown type '{data_type}' in namespace '{namespace}'")]
    UnknownType {
        path: String,
        namespace: String,
        data_type: String,
    },
}

impl ValidationError {
    /// Path of the builder (or attribute) the finding is about.
    pub fn path(&self) -> &str {
        match self {
            ValidationError::MissingAttribute { path, .. }
            | ValidationError::MissingDataset { path, .. }
            | ValidationError::MissingGroup { path, .. }
            | ValidationError::DtypeMismatch { path, .. }
            | ValidationError::ShapeMismatch { path, .. }
            | ValidationError::QuantityMismatch { path, .. }
            | ValidationError::UnknownType { path, .. } => path,
        }
    }
}

/// Any failure produced by this crate.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Builder(#[from] BuilderError),

    #[error(transparent)]
    TypeMap(#[from] TypeMapError),

    #[error(transparent)]
    AlreadyWritten(#[from] AlreadyWrittenError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{path}: '{container}' is linked or referenced but is not part of the graph being built")]
    OrphanContainerBuild { path: String, container: String },

    #[error("cannot construct '{path}': {source}")]
    Construct {
        path: String,
        #[source]
        source: Box<Error>,
    },

    #[error("'{path}' has no data_type attribute")]
    Untyped { path: String },

    #[error("'{path}' is missing required field '{field}'")]
    MissingRequired { path: String, field: String },

    #[error("field '{field}' of '{container}' holds {found}, expected {expected}")]
    UnexpectedFieldValue {
        container: String,
        field: String,
        found: &'static str,
        expected: &'static str,
    },

    #[error("nesting deeper than {max} levels at '{path}'")]
    DepthExceeded { path: String, max: usize },
}

impl From<SpecError> for Error {
    fn from(err: SpecError) -> Self {
        Error::Catalog(CatalogError::Spec(err))
    }
}

impl Error {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Catalog(err) => match err {
                CatalogError::Spec(_) | CatalogError::DuplicateType { .. } | CatalogError::InheritanceCycle { .. } => {
                    ErrorKind::SpecValidation
                }
                CatalogError::DuplicateNamespace { .. } => ErrorKind::DuplicateNamespace,
                CatalogError::NamespaceNotFound { .. }
                | CatalogError::UnresolvedDependency { .. }
                | CatalogError::TypeDoesNotExist { .. } => ErrorKind::TypeResolution,
            },
            Error::Conversion(_) => ErrorKind::Conversion,
            Error::Container(_) => ErrorKind::Container,
            Error::Builder(BuilderError::OrphanBuilder { .. }) => ErrorKind::OrphanBuilder,
            Error::Builder(_) => ErrorKind::Builder,
            Error::TypeMap(_) => ErrorKind::TypeMap,
            Error::AlreadyWritten(_) => ErrorKind::AlreadyWritten,
            Error::Backend(_) => ErrorKind::Backend,
            Error::Config(_) => ErrorKind::Config,
            Error::OrphanContainerBuild { .. } => ErrorKind::OrphanContainerBuild,
            Error::Construct { .. } | Error::Untyped { .. } | Error::MissingRequired { .. } => ErrorKind::Construct,
            Error::UnexpectedFieldValue { .. } | Error::DepthExceeded { .. } => ErrorKind::Builder,
        }
    }

    /// Returns the innermost error beneath any `Construct` wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Construct { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Wraps this error as a construct failure at `path`, unless it already is one.
    pub(crate) fn in_construct(self, path: &str) -> Error {
        match self {
            Error::Construct { .. } => self,
            other => Error::Construct {
                path: path.to_string(),
                source: Box::new(other),
            },
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let err: Error = CatalogError::TypeDoesNotExist {
            namespace: "core".into(),
            data_type: "Missing".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::TypeResolution);

        let err: Error = SpecError::MissingKey {
            path: "Foo".into(),
            key: "doc",
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::SpecValidation);
        assert_eq!(err.kind().name(), "SpecValidationError");
    }

    #[test]
    fn test_construct_wrapping() {
        let inner = Error::MissingRequired {
            path: "/root/a".into(),
            field: "data".into(),
        };
        let wrapped = inner.clone().in_construct("/root/a");
        assert_eq!(wrapped.kind(), ErrorKind::Construct);
        assert_eq!(wrapped.root_cause(), &inner);

        // already wrapped errors keep their innermost path
        let twice = wrapped.clone().in_construct("/root");
        assert_eq!(twice, wrapped);
    }
}
