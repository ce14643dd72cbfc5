use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The taxonomy every fallible operation in this crate is ultimately mapped into. Only
/// `Transient` failures are retried by the reconciler; `Fatal` failures move the object to
/// `Failed`; `NotFound` is handled explicitly wherever absence has a defined meaning.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Category {
    Transient,
    NotFound,
    Fatal,
}

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum Error {
    #[snafu(display("NodeRefresh object ('{}') has an invalid spec: '{}'", name, source))]
    InvalidSpec {
        source: validator::ValidationErrors,
        name: String,
    },

    #[snafu(display("NodeRefresh status must have a valid rfc3339 timestamp: '{}'", source))]
    TimestampFormat { source: chrono::ParseError },
}
