pub mod index_repair;
