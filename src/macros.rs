/// Shorthand for `.to_string()`.
macro_rules! s {
    ($e:expr) => {
        $e.to_string()
    };
}
