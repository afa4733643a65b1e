mod common;
mod counter_store_tests;
