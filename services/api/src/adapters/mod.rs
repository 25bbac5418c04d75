pub mod db;
pub mod missions;

pub use db::DbAdapter;
pub use missions::HttpMissionAdapter;
