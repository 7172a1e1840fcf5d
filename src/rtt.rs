use std::cmp::{max, min};
use tracing::info;

/// Clock granularity G from RFC 6298, in milliseconds.
const CLOCK_GRANULARITY: i64 = 1000;

/// RFC 6298 retransmission timeout estimator. All values are in
///  milliseconds; `srtt < 0` means no sample has been taken yet.
pub struct RttEstimator {
    srtt: i64,
    rttvar: i64,
    rto: i64,
    min_rto: i64,
    max_rto: i64,
}

impl RttEstimator {
    pub fn new(min_rto: i64, max_rto: i64) -> RttEstimator {
        RttEstimator {
            srtt: -1,
            rttvar: -1,
            rto: min_rto,
            min_rto,
            max_rto,
        }
    }

    pub fn rto(&self) -> i64 {
        self.rto
    }

    pub fn srtt(&self) -> i64 {
        self.srtt
    }

    pub fn rttvar(&self) -> i64 {
        self.rttvar
    }

    pub fn set_bounds(&mut self, min_rto: i64, max_rto: i64) {
        self.min_rto = min_rto;
        self.max_rto = max_rto;
        self.rto = max(min(self.rto, max_rto), min_rto);
    }

    /// Feed one round-trip sample. Non-positive samples are discarded.
    pub fn on_sample(&mut self, rtt: i64) {
        if rtt <= 0 {
            return;
        }

        if self.srtt < 0 {
            // RFC 6298 2.2
            self.srtt = rtt;
            self.rttvar = rtt / 2;
        } else {
            // RFC 6298 2.3 - alpha 1/8, beta 1/4
            self.rttvar = (3 * self.rttvar + (self.srtt - rtt).abs()) / 4;
            self.srtt = (7 * self.srtt + rtt) / 8;
        }
        self.rto = self.srtt + max(CLOCK_GRANULARITY, 4 * self.rttvar);

        // RFC 6298 2.4 / 2.5
        self.rto = max(self.rto, self.min_rto);
        self.rto = min(self.rto, self.max_rto);

        info!(
            "timeout state: rttvar {} srtt {} rto {}",
            self.rttvar, self.srtt, self.rto
        );
    }

    /// Back-off applied when the queue head is retransmitted.
    ///
    /// RFC 6298 5.5. NB: `max(rto * 2, max_rto)` pins the RTO at `max_rto`
    ///  on the first retransmission instead of doubling towards it - see
    ///  DESIGN.md before touching this.
    pub fn backoff(&mut self) {
        self.rto = min(max(self.rto * 2, self.max_rto), self.max_rto);

        info!(
            "timeout state: rttvar {} srtt {} rto {}",
            self.rttvar, self.srtt, self.rto
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::first_sample(vec![200], 200, 100, 1200)]
    #[case::first_sample_small_var(vec![10], 10, 5, 1010)]
    #[case::second_sample(vec![200, 400], 225, 125, 1225)]
    #[case::negative_discarded(vec![-5, 200], 200, 100, 1200)]
    #[case::zero_discarded(vec![0], -1, -1, 100)]
    fn test_sample_formulas(
        #[case] samples: Vec<i64>,
        #[case] expected_srtt: i64,
        #[case] expected_rttvar: i64,
        #[case] expected_unclamped_rto: i64,
    ) {
        let mut est = RttEstimator::new(100, 100_000);
        for s in samples {
            est.on_sample(s);
        }
        assert_eq!(est.srtt(), expected_srtt);
        assert_eq!(est.rttvar(), expected_rttvar);
        assert_eq!(est.rto(), expected_unclamped_rto);
    }

    #[rstest]
    #[case::clamped_high(100, 1000, 5000, 1000)]
    #[case::clamped_low(2000, 5000, 1, 2000)]
    #[case::in_range(100, 5000, 500, 1500)]
    fn test_rto_clamping(
        #[case] min_rto: i64,
        #[case] max_rto: i64,
        #[case] sample: i64,
        #[case] expected_rto: i64,
    ) {
        let mut est = RttEstimator::new(min_rto, max_rto);
        est.on_sample(sample);
        assert_eq!(est.rto(), expected_rto);
        assert!(est.rto() >= min_rto && est.rto() <= max_rto);
    }

    #[test]
    fn test_backoff_pins_at_max_rto() {
        let mut est = RttEstimator::new(100, 1000);
        assert_eq!(est.rto(), 100);

        est.backoff();
        assert_eq!(est.rto(), 1000);

        est.backoff();
        assert_eq!(est.rto(), 1000);
    }

    #[test]
    fn test_initial_rto_is_min_rto() {
        let est = RttEstimator::new(250, 1000);
        assert_eq!(est.rto(), 250);
        assert_eq!(est.srtt(), -1);
    }
}
