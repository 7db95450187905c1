//! `GET /api/kubeconfig`: contexts available in the user's own kubeconfig,
//! so the control plane can offer them for tunnelling.

use axum::{http::StatusCode, Json};
use serde_json::{json, Value};

use crate::kubeconfig::{self, KubeconfigError};

pub async fn local_kubeconfig() -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let path = kubeconfig::local_path();
    match kubeconfig::load_from(&path).await {
        Ok(doc) => Ok(Json(json!({
            "path": path,
            "currentContext": doc.current_context,
            "contexts": doc.contexts.iter().map(|c| json!({
                "name": c.name,
                "cluster": c.context.cluster,
                "namespace": c.context.namespace,
            })).collect::<Vec<_>>(),
            "clusters": doc.clusters.iter().map(|c| json!({
                "name": c.name,
                "server": c.cluster.server,
            })).collect::<Vec<_>>(),
        }))),
        Err(e @ KubeconfigError::Read { .. }) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": e.to_string(), "code": "KUBECONFIG_NOT_FOUND"})),
        )),
        Err(e) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": e.to_string(), "code": "KUBECONFIG_INVALID"})),
        )),
    }
}
