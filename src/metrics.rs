// Metrics hooks for checkout and gateway events.
// No backend is wired in; attach one by replacing these no-ops.

#[macro_export]
macro_rules! checkout_counter_inc {
    ($name:expr $(, $key:expr => $val:expr )* $(,)?) => {
        let _ = ($name $(, $key, $val )*);
    };
}

#[macro_export]
macro_rules! checkout_histogram_observe_ms {
    ($name:expr, $ms:expr $(, $key:expr => $val:expr )* $(,)?) => {
        let _ = ($name, $ms $(, $key, $val )*);
    };
}
