use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
};
use classroom_sync::{ClassroomRegistry, RelayState};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, Level};

const DEFAULT_ADDR: &str = "127.0.0.1:3030";

#[derive(Debug, Serialize)]
struct ClassroomStats {
    id: String,
    members: usize,
    online_students: Vec<String>,
    teacher: Option<String>,
    editable: bool,
    assignments: Vec<String>,
}

async fn get_classroom(
    State(state): State<RelayState>,
    Path(id): Path<String>,
) -> Result<Json<ClassroomStats>, StatusCode> {
    state
        .classrooms()
        .with_classroom(&id, |classroom| ClassroomStats {
            id: classroom.id().to_string(),
            members: classroom.member_count(),
            online_students: classroom.online_students(),
            teacher: classroom.teacher().map(|teacher| teacher.user_id.clone()),
            editable: classroom.is_editable(),
            assignments: classroom
                .assignments()
                .map(|assignment| assignment.name.clone())
                .collect(),
        })
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let addr = std::env::var("CLASSROOM_RELAY_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());

    info!("Starting classroom relay...");

    let state = RelayState::new(Arc::new(ClassroomRegistry::new()));
    let app = classroom_sync::router_with_relay_state(state.clone())
        .route("/classrooms/{id}", get(get_classroom))
        .with_state(state);

    let listener = TcpListener::bind(&addr).await?;
    info!("Relay running on http://{}", addr);
    info!("WebSocket endpoint available at ws://{}/ws/{{classroom_id}}", addr);
    info!("  GET    /classrooms/{{id}}  - Classroom roster, lock state and assignments");

    axum::serve(listener, app).await?;

    Ok(())
}
