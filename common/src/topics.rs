pub const TOPIC_STATE_PREFIX: &str = "offset/state/";
pub const TOPIC_STATE_WILDCARD: &str = "offset/state/#";

pub const TOPIC_CMD_PREFIX: &str = "offset/cmnd/";
pub const TOPIC_CMD_FORCE_COMPENSATION: &str = "offset/cmnd/service/force_compensation";
pub const TOPIC_CMD_RESET_LEARNING: &str = "offset/cmnd/service/reset_learning";
pub const TOPIC_CMD_SET_PREHEAT: &str = "offset/cmnd/service/set_preheat";
pub const TOPIC_SERVICE_WILDCARD: &str = "offset/cmnd/service/+";

/// Entity id addressed by a state topic, if the topic is one.
pub fn entity_from_state_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(TOPIC_STATE_PREFIX)
        .filter(|entity_id| !entity_id.is_empty() && !entity_id.contains('/'))
}

pub fn temperature_command_topic(entity_id: &str) -> String {
    format!("{TOPIC_CMD_PREFIX}{entity_id}/temperature")
}

pub fn hvac_mode_command_topic(entity_id: &str) -> String {
    format!("{TOPIC_CMD_PREFIX}{entity_id}/hvac_mode")
}

pub fn room_state_topic(slug: &str) -> String {
    format!("offset/room/{slug}/state")
}
