pub const LABTRACK_DISPLAY_VERSION: &str = env!("LABTRACK_DISPLAY_VERSION");
pub const LABTRACK_BUILD_N: &str = env!("LABTRACK_BUILD_N");

pub fn version_cli_text() -> String {
    format!(
        "labtrack {}\nBuild {}\nProtocol {}\nLaboratory provenance tracking and sample sheets",
        LABTRACK_DISPLAY_VERSION,
        LABTRACK_BUILD_N,
        labtrack_protocol::PROTOCOL_VERSION
    )
}
