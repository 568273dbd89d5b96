pub mod entity;
pub mod init;
pub mod table_fk_index;
pub mod table_row;
