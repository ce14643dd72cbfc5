use std::sync::Arc;

use kube::api::Api;
use models::constants::worker_pool_size;
use models::node::{K8sApiGateway, NodeRefresh};
use models::telemetry::init_telemetry_from_env;
use snafu::ResultExt;
use tracing::{event, Level};

use controller::error::{self, Result};
use controller::runtime::{watch_noderefreshes, Runtime};

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry_from_env().context(error::TracingConfiguration)?;

    let k8s_client = kube::Client::try_default()
        .await
        .context(error::ClientCreate)?;

    let noderefreshes: Api<NodeRefresh> = Api::all(k8s_client.clone());
    let (store, reflector_drainer) = watch_noderefreshes(noderefreshes);

    let gateway = Arc::new(K8sApiGateway::new(k8s_client));
    let runtime = Arc::new(Runtime::new(gateway, store, worker_pool_size()));
    let scheduling_loop = runtime.run();

    tokio::select! {
        _ = reflector_drainer => {
            event!(Level::ERROR, "NodeRefresh watch stream ended unexpectedly.");
        },
        _ = scheduling_loop => {
            event!(Level::ERROR, "Scheduling loop exited unexpectedly.");
        },
    };

    Ok(())
}
