//! Header names carrying the requester context.

pub const REQUEST_ID: &str = "x-device-request-id";
pub const USER: &str = "x-request-user";
pub const TEAM: &str = "x-team";
pub const JOB_LINK: &str = "x-job-link";
pub const REQUESTOR_IP: &str = "x-requestor-ip";
pub const FORWARDED_FOR: &str = "x-forwarded-for";
