/// How the router should select a callee when several registered the same procedure.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum InvocationPolicy {
    /// Only one callee may register the procedure.
    #[default]
    Single,
    /// Callees are invoked in order of registration.
    RoundRobin,
    /// A random callee is invoked.
    Random,
    /// The first callee is invoked.
    First,
    /// The last callee is invoked.
    Last,
}

impl From<InvocationPolicy> for &'static str {
    fn from(value: InvocationPolicy) -> Self {
        match value {
            InvocationPolicy::Single => "single",
            InvocationPolicy::RoundRobin => "roundrobin",
            InvocationPolicy::Random => "random",
            InvocationPolicy::First => "first",
            InvocationPolicy::Last => "last",
        }
    }
}
