//! Ordered capability negotiation: try the richer variant first, fall back
//! to the baseline, report the first success.

use dxshim_intercept::HRESULT;
use log::debug;

/// Why a strategy did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Declined {
    /// The capability is absent; nothing was attempted.
    Unavailable,
    /// The attempt ran and failed with this code.
    Failed(HRESULT),
}

#[derive(Debug, PartialEq, Eq)]
pub struct Negotiated<T> {
    pub value: T,
    pub strategy: &'static str,
}

type Strategy<'a, T> = Box<dyn FnOnce() -> Result<T, Declined> + 'a>;

/// A list of strategies run in order until one succeeds. Each strategy runs
/// at most once and cleans up its own intermediates before declining.
pub struct Negotiation<'a, T> {
    operation: &'static str,
    unavailable_code: HRESULT,
    strategies: Vec<(&'static str, Strategy<'a, T>)>,
}

impl<'a, T> Negotiation<'a, T> {
    pub fn new(operation: &'static str, unavailable_code: HRESULT) -> Self {
        Self {
            operation,
            unavailable_code,
            strategies: Vec::new(),
        }
    }

    pub fn strategy(
        mut self,
        name: &'static str,
        f: impl FnOnce() -> Result<T, Declined> + 'a,
    ) -> Self {
        self.strategies.push((name, Box::new(f)));
        self
    }

    /// Run the strategies. On total failure the code of the last strategy
    /// that actually failed is returned, or `unavailable_code` if none ran.
    pub fn run(self) -> Result<Negotiated<T>, HRESULT> {
        let mut last_failure = None;
        for (name, attempt) in self.strategies {
            match attempt() {
                Ok(value) => {
                    debug!("{}: {} succeeded", self.operation, name);
                    return Ok(Negotiated {
                        value,
                        strategy: name,
                    });
                }
                Err(Declined::Unavailable) => {
                    debug!("{}: {} unavailable", self.operation, name);
                }
                Err(Declined::Failed(hr)) => {
                    debug!("{}: {} failed with {:#010x}", self.operation, name, hr);
                    last_failure = Some(hr);
                }
            }
        }
        Err(last_failure.unwrap_or(self.unavailable_code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const NOT_AVAILABLE: HRESULT = 0x8876_086A_u32 as HRESULT;

    #[test]
    fn first_success_wins_and_later_strategies_do_not_run() {
        let later_ran = Cell::new(false);
        let outcome = Negotiation::new("create", NOT_AVAILABLE)
            .strategy("enhanced", || Ok(1))
            .strategy("standard", || {
                later_ran.set(true);
                Ok(2)
            })
            .run();
        assert_eq!(
            outcome,
            Ok(Negotiated {
                value: 1,
                strategy: "enhanced"
            })
        );
        assert!(!later_ran.get());
    }

    #[test]
    fn falls_back_in_order() {
        let order = std::cell::RefCell::new(Vec::new());
        let outcome = Negotiation::new("create", NOT_AVAILABLE)
            .strategy("enhanced", || {
                order.borrow_mut().push("enhanced");
                Err(Declined::Failed(-1))
            })
            .strategy("standard", || {
                order.borrow_mut().push("standard");
                Ok("device")
            })
            .run();
        assert_eq!(outcome.map(|n| n.strategy), Ok("standard"));
        assert_eq!(*order.borrow(), vec!["enhanced", "standard"]);
    }

    #[test]
    fn baseline_failure_code_is_returned() {
        let outcome: Result<Negotiated<()>, HRESULT> = Negotiation::new("create", NOT_AVAILABLE)
            .strategy("enhanced", || Err(Declined::Failed(-1)))
            .strategy("standard", || Err(Declined::Failed(-2)))
            .run();
        assert_eq!(outcome, Err(-2));
    }

    #[test]
    fn all_unavailable_reports_unavailable_code() {
        let outcome: Result<Negotiated<()>, HRESULT> = Negotiation::new("create", NOT_AVAILABLE)
            .strategy("enhanced", || Err(Declined::Unavailable))
            .strategy("standard", || Err(Declined::Unavailable))
            .run();
        assert_eq!(outcome, Err(NOT_AVAILABLE));

        let empty: Result<Negotiated<()>, HRESULT> = Negotiation::new("create", -5).run();
        assert_eq!(empty, Err(-5));
    }

    #[test]
    fn unavailable_after_a_failure_keeps_the_failure() {
        let outcome: Result<Negotiated<()>, HRESULT> = Negotiation::new("create", NOT_AVAILABLE)
            .strategy("enhanced", || Err(Declined::Failed(-3)))
            .strategy("standard", || Err(Declined::Unavailable))
            .run();
        assert_eq!(outcome, Err(-3));
    }
}
