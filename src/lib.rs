pub mod compression;
pub mod config;
pub mod proxy;
pub mod proxy_common;

pub use compression::{wrap, CompressedStream, StreamCompress};
pub use config::{Role, StreamCompressConfig};

pub mod errors {
    error_chain::error_chain! {
        foreign_links {
            IoError(std::io::Error);
            JsonError(serde_json::Error);
        }

        errors {
            Config(msg: String) {
                description("invalid stream compression configuration")
                display("invalid stream compression configuration: {}", msg)
            }
            Codec(msg: String) {
                description("compression codec failure")
                display("compression codec failure: {}", msg)
            }
            Shutdown(msg: String) {
                description("error while shutting down a compressed stream")
                display("error while shutting down a compressed stream: {}", msg)
            }
            NotOpen {
                description("compressed stream is not open")
                display("compressed stream is not open")
            }
        }
    }
}
