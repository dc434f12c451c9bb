//! Unit test modules.

mod ftms_parser_test;
mod reading_buffer_test;
mod zones_test;
