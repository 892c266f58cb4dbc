mod support;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};

use metrics::{Counter, Gauge, GaugeFn, Histogram, Key, KeyName, Recorder, SharedString, Unit};
use support::*;

type Gauges = Arc<Mutex<BTreeMap<String, f64>>>;

/// Keeps the last value of every `label_conflicts` series, keyed by classifier.
struct ConflictRecorder {
    gauges: Gauges,
}

struct Slot {
    gauges: Gauges,
    classifier: String,
}

impl GaugeFn for Slot {
    fn increment(&self, value: f64) {
        *self.gauges.lock().unwrap().entry(self.classifier.clone()).or_default() += value;
    }

    fn decrement(&self, value: f64) {
        *self.gauges.lock().unwrap().entry(self.classifier.clone()).or_default() -= value;
    }

    fn set(&self, value: f64) {
        self.gauges.lock().unwrap().insert(self.classifier.clone(), value);
    }
}

impl Recorder for ConflictRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, _: &Key) -> Counter {
        Counter::noop()
    }

    fn register_gauge(&self, key: &Key) -> Gauge {
        if key.name() != "label_conflicts" {
            return Gauge::noop();
        }
        let classifier =
            key.labels().find(|l| l.key() == "classifier").map(|l| l.value().to_string()).unwrap_or_default();
        Gauge::from_arc(Arc::new(Slot { gauges: self.gauges.clone(), classifier }))
    }

    fn register_histogram(&self, _: &Key) -> Histogram {
        Histogram::noop()
    }
}

fn gauges() -> &'static Gauges {
    static GAUGES: OnceLock<Gauges> = OnceLock::new();
    GAUGES.get_or_init(|| {
        let gauges = Gauges::default();
        metrics::set_boxed_recorder(Box::new(ConflictRecorder { gauges: gauges.clone() })).unwrap();
        gauges
    })
}

fn conflicts(classifier: &str) -> Option<f64> {
    gauges().lock().unwrap().get(classifier).copied()
}

#[tokio::test]
async fn conflict_gauge_is_zeroed_when_classifier_is_deleted() {
    gauges();
    let h = Harness::collect().with_clusters(&["a"]);
    h.fleet.add_classifier(classifier("p1", &[("team", "payments")]));
    h.fleet.add_classifier(classifier("p2", &[("team", "billing")]));
    {
        let mut st = h.fleet.state();
        st.reports.push(report("p1", "a", true));
        st.reports.push(report("p2", "a", true));
    }
    h.reconciler.reconcile("p1").await.unwrap();
    h.reconciler.reconcile("p2").await.unwrap();
    assert_eq!(conflicts("p1"), Some(0.0));
    assert_eq!(conflicts("p2"), Some(1.0));

    h.fleet.mark_deleting("p2");
    h.reconciler.reconcile("p2").await.unwrap();
    assert_eq!(conflicts("p2"), Some(0.0));
}
