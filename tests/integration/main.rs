// Drives the full messaging stack against the in-memory broker.
mod connection_test;
mod publisher_test;
mod request_response_test;
mod support;
