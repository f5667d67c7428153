/// OpenAPI documentation generation.
pub mod documentation;
/// Health check service.
pub mod health_service;
/// Room reaper sweeping closed and abandoned rooms.
pub mod reaper;
/// Room lifecycle: creation, joining, snapshots, teardown.
pub mod room_service;
/// Engine event to SSE bridging.
pub mod sse_events;
/// Server-Sent Events broadcasting service.
pub mod sse_service;
/// Turn control and actor action handling.
pub mod turn_service;
/// WebSocket connection and message handling service.
pub mod websocket_service;
