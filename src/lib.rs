pub mod paperback;
