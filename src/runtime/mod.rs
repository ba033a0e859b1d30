//! The in-page hot-reload runtime.
//!
//! The runtime is shipped as a JavaScript asset and reaches the page in one
//! of two ways: prepended to the intercepted bundle in hot mode, or fetched
//! directly from the control plane's `/runtime.js` endpoint.

/// Default port of the hot-reload control plane.
pub const DEFAULT_WS_PORT: u16 = 8643;

const RUNTIME_SOURCE: &str = include_str!("hmr_runtime.js");

/// The raw in-page runtime source.
pub fn runtime_source() -> &'static str {
    RUNTIME_SOURCE
}

/// The full hot-mode injection prefix: the runtime-configuration line
/// exposing the control-plane port, followed by the runtime itself.
pub fn hot_prelude(ws_port: u16) -> String {
    format!("var __pcfHmrWsPort = {ws_port};\n{RUNTIME_SOURCE}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prelude_declares_port_on_first_line() {
        let prelude = hot_prelude(9999);
        let first_line = prelude.lines().next().unwrap();
        assert_eq!(first_line, "var __pcfHmrWsPort = 9999;");
    }

    #[test]
    fn runtime_speaks_the_wire_protocol() {
        assert!(runtime_source().contains("pcf-hmr:reload"));
        assert!(runtime_source().contains("pcf-hmr:ack"));
        // The injected global read by the runtime, declared by the prelude.
        assert!(runtime_source().contains("__pcfHmrWsPort"));
    }
}
