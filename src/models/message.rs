use serde::{Deserialize, Serialize};

/// Projection of one schedule carried through the worker queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRef {
    pub user_id: String,
    pub route_id: String,
    pub arrive_by: String,
    pub timezone: String,
    pub days_of_week: Vec<String>,
}

/// Body of one queue message: up to one chunk of route references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMessage {
    pub routes: Vec<RouteRef>,
}
