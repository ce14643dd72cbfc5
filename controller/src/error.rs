use snafu::Snafu;

/// The crate-wide result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The crate-wide error type for the process-level concerns `main` handles directly: client
/// setup and telemetry. Reconcile-time errors never reach this type; they are captured in
/// `.status` by the reconciler instead, per the Reconciler's error-handling design.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to create Kubernetes client: '{}'", source))]
    ClientCreate { source: kube::Error },

    #[snafu(display("Error configuring tracing: '{}'", source))]
    TracingConfiguration {
        source: models::telemetry::TelemetryConfigError,
    },
}
