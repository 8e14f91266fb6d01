pub const TOPIC_IMAGE: &str = "solarcam/image";

pub const TOPIC_CONFIG_SET: &str = "solarcam/config/set";
pub const TOPIC_CONFIG_ACK: &str = "solarcam/config/ack";
