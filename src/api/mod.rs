pub mod middleware;
pub mod routes;

// Re-export public types and functions
pub use middleware::log_request_errors;
pub use routes::{
    backup_database, delete_video, disable_loop, enable_loop, get_stream_config,
    get_system_config, install_database, list_backups, list_videos, loop_status, reorder_videos,
    save_stream_config, save_system_config, set_current_video, start_stream, stop_stream,
    stream_status, test_stream, upload_video,
};
