pub const TOPIC_DEVICE_STATE: &str = "circadian/device/state";
pub const TOPIC_DEVICE_SCHEDULE: &str = "circadian/device/schedule";
pub const TOPIC_DEVICE_TELEMETRY: &str = "circadian/device/telemetry";

pub const TOPIC_CMD_FETCH: &str = "circadian/cmnd/fetch";
