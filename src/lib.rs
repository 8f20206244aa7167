pub mod record;
pub mod serializer;
pub mod formatter;
pub mod layer;
pub mod init;
