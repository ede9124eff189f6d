//! Integrator output and per-neuron voltage traces.

use crate::{extract_voltages, ReducedSystem};
use ndarray::{Array1, Array2};
use nwire_core::{NwireError, Result, TimeSeries};
use serde::{Deserialize, Serialize};

/// Samples returned by an external integrator: one row per time point, one
/// column per state of the reduced system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    time: Array1<f64>,
    values: Array2<f64>,
}

impl Trajectory {
    pub fn new(time: Array1<f64>, values: Array2<f64>) -> Result<Self> {
        if values.nrows() != time.len() {
            return Err(NwireError::TrajectoryShape {
                expected: time.len(),
                got: values.nrows(),
            });
        }
        Ok(Self { time, values })
    }

    pub fn time(&self) -> &Array1<f64> {
        &self.time
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

/// A reduced system together with a trajectory over its states.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    system: ReducedSystem,
    trajectory: Trajectory,
}

impl Solution {
    pub fn new(system: ReducedSystem, trajectory: Trajectory) -> Result<Self> {
        let expected = system.states().len();
        let got = trajectory.values.ncols();
        if expected != got {
            return Err(NwireError::TrajectoryShape { expected, got });
        }
        Ok(Self { system, trajectory })
    }

    pub fn system(&self) -> &ReducedSystem {
        &self.system
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }
}

/// One membrane voltage trace per neuron, in neuron order. Clamped voltages
/// are evaluated from their observed definitions at every sample.
pub fn voltage_traces(solution: &Solution) -> Result<Vec<TimeSeries>> {
    let system = &solution.system;
    let voltages = extract_voltages(system)?;
    let trajectory = &solution.trajectory;

    let mut traces: Vec<TimeSeries> = voltages
        .iter()
        .map(|v| TimeSeries::new(&v.neuron).with_units("mV"))
        .collect();
    for (t, row) in trajectory.time.iter().zip(trajectory.values.rows()) {
        let y = row.to_owned();
        for (trace, v) in traces.iter_mut().zip(&voltages) {
            trace.push(*t, system.evaluate(v.var, &y));
        }
    }
    Ok(traces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{build_network, Connections};
    use ndarray::array;
    use nwire_components::{models, SynapseKind, SynapseSpec};

    fn clamped_pair() -> ReducedSystem {
        let neurons = vec![
            models::voltage_clamp("VC", -40.0).unwrap(),
            models::hodgkin_huxley("HH").unwrap(),
        ];
        let mut conns = Connections::new();
        conns.connect("VC", "HH", SynapseSpec::new(SynapseKind::Exc, 1.0));
        build_network(&conns, &neurons).unwrap()
    }

    #[test]
    fn test_trajectory_shape() {
        let err = Trajectory::new(array![0.0, 1.0], Array2::zeros((3, 2))).unwrap_err();
        assert_eq!(err, NwireError::TrajectoryShape { expected: 2, got: 3 });

        let system = clamped_pair();
        let wrong = Trajectory::new(array![0.0], Array2::zeros((1, 2))).unwrap();
        assert!(matches!(
            Solution::new(system, wrong),
            Err(NwireError::TrajectoryShape { got: 2, .. })
        ));
    }

    #[test]
    fn test_voltage_traces_read_states_and_clamps() {
        let system = clamped_pair();
        let n = system.states().len();
        let hh_v = system
            .state_index(system.canonical_of("HH.soma.v").unwrap())
            .unwrap();
        let mut values = Array2::zeros((2, n));
        values[[0, hh_v]] = -65.0;
        values[[1, hh_v]] = -30.0;
        let trajectory = Trajectory::new(array![0.0, 0.5], values).unwrap();
        let solution = Solution::new(system, trajectory).unwrap();

        let traces = voltage_traces(&solution).unwrap();
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].name, "VC");
        assert_eq!(traces[0].values, vec![-40.0, -40.0]);
        assert_eq!(traces[1].values, vec![-65.0, -30.0]);
        assert_eq!(traces[1].time, vec![0.0, 0.5]);
        assert_eq!(traces[1].units.as_deref(), Some("mV"));
    }
}
