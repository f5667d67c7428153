use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for Buzzwire.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::sse::room_stream,
        crate::routes::websocket::ws_handler,
        crate::routes::room::create_room,
        crate::routes::room::join_room,
        crate::routes::room::room_snapshot,
        crate::routes::room::close_room,
        crate::routes::turn::start_room,
        crate::routes::turn::open_turn,
        crate::routes::turn::repeat_turn,
        crate::routes::turn::pause,
        crate::routes::turn::resume,
        crate::routes::turn::validate,
        crate::routes::turn::skip,
        crate::routes::turn::end_room,
        crate::routes::turn::buzz,
        crate::routes::turn::vote,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::room::CreateRoomRequest,
            crate::dto::room::JoinRoomRequest,
            crate::dto::room::JoinRole,
            crate::dto::room::JoinedResponse,
            crate::dto::room::RoomCreatedResponse,
            crate::dto::room::RoomStateSummary,
            crate::dto::room::ParticipantSummary,
            crate::dto::room::TurnSummary,
            crate::dto::room::ProposalSummary,
            crate::dto::turn::ControllerRequest,
            crate::dto::turn::OpenTurnRequest,
            crate::dto::turn::TurnKindInput,
            crate::dto::turn::DifficultyInput,
            crate::dto::turn::OptionInput,
            crate::dto::turn::ValidateRequest,
            crate::dto::turn::BuzzRequest,
            crate::dto::turn::VoteRequest,
            crate::dto::turn::ActionResponse,
            crate::dto::turn::OutcomeResponse,
            crate::dto::ws::ActorInboundMessage,
            crate::dto::ws::ActorAck,
            crate::dto::ws::ActionFeedback,
            crate::dto::sse::Handshake,
        )
    ),
    tags(
        (name = "room", description = "Room lifecycle"),
        (name = "turn", description = "Controller-only turn operations"),
        (name = "action", description = "Actor buzz and vote actions"),
        (name = "sse", description = "Server-sent events streams"),
    )
)]
pub struct ApiDoc;
