mod paths;
mod safe_write;

pub use paths::safe_join;
pub use safe_write::{
    append_json_line, read_json_lines, set_dir_private, set_file_private, write_json_atomic,
};
