//! End-to-end assembly scenarios.

use nwire_components::{
    make_component, models, Component, Overrides, PortRole, StateVar, SynapseKind, SynapseSpec,
};
use nwire_core::{Domain, Equation, ErrorKind, NwireError};
use nwire_network::{
    build_network, build_network_split, extract_voltages, inspect_network,
    parse_sol_for_membrane_voltages, reduce, resolve_network, Connections, ContributionSource,
};

fn hh(names: &[&str]) -> Vec<Component> {
    names
        .iter()
        .map(|n| models::hodgkin_huxley(n).unwrap())
        .collect()
}

#[test]
fn single_excitatory_synapse() {
    let neurons = hh(&["pre", "post"]);
    let mut conns = Connections::new();
    conns.connect("pre", "post", SynapseSpec::new(SynapseKind::Exc, 0.5));

    let graph = resolve_network(&conns, &neurons).unwrap();
    assert_eq!(graph.synapses().len(), 1);

    let system = reduce(graph).unwrap();
    let summary = inspect_network(&system).unwrap();
    assert_eq!(summary.neuron_synapses["post"], 1);
    assert_eq!(summary.neuron_synapses["pre"], 0);
    assert_eq!(extract_voltages(&system).unwrap().len(), 2);
}

#[test]
fn two_synapses_between_the_same_pair() {
    let neurons = hh(&["AB", "LP"]);
    let mut conns = Connections::new();
    conns
        .connect("AB", "LP", SynapseSpec::new(SynapseKind::Chol, 30.0))
        .connect("AB", "LP", SynapseSpec::new(SynapseKind::Glut, 30.0));

    let graph = resolve_network(&conns, &neurons).unwrap();
    let names: Vec<&str> = graph.synapses().iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["AB_LP_chol", "AB_LP_glut"]);

    let balance = graph.balance("LP", PortRole::I).unwrap();
    assert_eq!(balance.synaptic_terms(), 2);
    assert_eq!(balance.intrinsic_terms(), 3);
    let sources: Vec<ContributionSource> = balance.terms.iter().map(|t| t.source).collect();
    assert_eq!(
        sources,
        vec![
            ContributionSource::Intrinsic,
            ContributionSource::Intrinsic,
            ContributionSource::Intrinsic,
            ContributionSource::Synapse(0),
            ContributionSource::Synapse(1),
        ]
    );

    let system = reduce(graph).unwrap();
    assert_eq!(inspect_network(&system).unwrap().neuron_synapses["LP"], 2);
}

#[test]
fn self_connection() {
    let neurons = hh(&["X"]);
    let mut conns = Connections::new();
    conns.connect("X", "X", SynapseSpec::new(SynapseKind::Inh, 1.0));

    let system = build_network(&conns, &neurons).unwrap();
    assert_eq!(inspect_network(&system).unwrap().neuron_synapses["X"], 1);

    let graph = resolve_network(&conns, &neurons).unwrap();
    let v = graph.neuron_port("X", PortRole::V).unwrap();
    assert_eq!(graph.couplings().iter().filter(|(_, n)| *n == v).count(), 2);
}

#[test]
fn custom_synapse_missing_reversal() {
    let neurons = hh(&["A", "B"]);
    let overrides: Overrides = [("v_th", -40.0), ("delta", 2.0), ("k", 0.1)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    let mut spec = SynapseSpec::new(SynapseKind::Custom, 1.0);
    spec.overrides = overrides;
    let mut conns = Connections::new();
    conns.connect("A", "B", spec);

    let err = resolve_network(&conns, &neurons).unwrap_err();
    assert_eq!(
        err,
        NwireError::MissingSynapseParameter {
            synapse: "A_B_custom".into(),
            parameter: "e_rev".into(),
        }
    );
    assert_eq!(err.kind(), ErrorKind::Specification);
}

#[test]
fn two_clamps_on_one_presynaptic_port() {
    let neurons = vec![
        models::voltage_clamp("clampA", -40.0).unwrap(),
        models::voltage_clamp("clampB", -20.0).unwrap(),
        models::hodgkin_huxley("target").unwrap(),
    ];
    let mut conns = Connections::new();
    conns.connect("clampA", "target", SynapseSpec::new(SynapseKind::Exc, 1.0));

    let mut graph = resolve_network(&conns, &neurons).unwrap();
    let pre = graph
        .synapse_port("clampA_target_exc", PortRole::Pre)
        .unwrap();
    let other = graph.neuron_port("clampB", PortRole::V).unwrap();
    graph.couple(pre, other).unwrap();

    let err = reduce(graph).unwrap_err();
    match &err {
        NwireError::OverdeterminedSystem {
            unknowns,
            equations,
            conflicting,
        } => {
            assert!(equations > unknowns);
            assert_eq!(conflicting, &vec!["clampA.v".to_string()]);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(err.kind(), ErrorKind::Structural);
    assert_eq!(err.imbalance(), Some(1));
}

#[test]
fn two_clamps_contradict_through_one_synapse() {
    let neurons = vec![
        models::voltage_clamp("clampA", -40.0).unwrap(),
        models::voltage_clamp("clampB", -20.0).unwrap(),
    ];
    let mut conns = Connections::new();
    conns.connect("clampA", "clampB", SynapseSpec::new(SynapseKind::Exc, 1.0));

    let mut graph = resolve_network(&conns, &neurons).unwrap();
    let pre = graph
        .synapse_port("clampA_clampB_exc", PortRole::Pre)
        .unwrap();
    let held = graph.neuron_port("clampB", PortRole::V).unwrap();
    graph.couple(pre, held).unwrap();

    let err = reduce(graph).unwrap_err();
    match &err {
        NwireError::OverdeterminedSystem { conflicting, .. } => {
            assert_eq!(conflicting, &vec!["clampA.v".to_string()]);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(err.kind(), ErrorKind::Structural);
    assert_eq!(err.imbalance(), Some(1));
}

#[test]
fn zero_weight_is_rejected_before_reduction() {
    let neurons = hh(&["A", "B"]);
    let mut conns = Connections::new();
    conns.connect("A", "B", SynapseSpec::new(SynapseKind::Exc, 0.0));

    let expected = NwireError::InvalidWeight {
        synapse: "A_B_exc".into(),
        weight: 0.0,
    };
    assert_eq!(resolve_network(&conns, &neurons).unwrap_err(), expected);
    for result in [
        build_network(&conns, &neurons),
        build_network_split(&conns, &neurons),
    ] {
        let err = result.unwrap_err();
        assert_eq!(err, expected);
        assert_eq!(err.kind(), ErrorKind::Specification);
    }
}

/// Leaf neuron that defines its own membrane current.
fn leaky(name: &str) -> Component {
    make_component(
        name,
        vec![
            StateVar::new("v", Domain::Voltage, -65.0),
            StateVar::new("i", Domain::Current, 0.0),
        ],
        &[("c", 1.0), ("g", 0.3), ("e", -54.4)],
        vec![
            Equation::parse("dv/dt = -i / c").unwrap(),
            Equation::parse("i = g * (v - e)").unwrap(),
        ],
        &[(PortRole::V, "v"), (PortRole::I, "i")],
    )
    .unwrap()
}

#[test]
fn leaf_current_definition_joins_the_balance() {
    let neurons = vec![leaky("L")];
    let standard = build_network(&Connections::new(), &neurons).unwrap();
    let split = build_network_split(&Connections::new(), &neurons).unwrap();
    assert!(standard.equivalent(&split));

    let v = standard.canonical_of("L.v").unwrap();
    assert_eq!(standard.states(), &[v]);
    let y = standard.initial_state(&Default::default()).unwrap();
    let expected = 0.3 * (-65.0 - -54.4);
    for name in ["L.i", "L.i_intrinsic"] {
        let id = standard.canonical_of(name).unwrap();
        assert!(!standard.is_state(id));
        assert!((standard.evaluate(id, &y) - expected).abs() < 1e-12);
    }
}

#[test]
fn leaf_current_definition_with_synapse() {
    let neurons = vec![leaky("L")];
    let mut conns = Connections::new();
    conns.connect("L", "L", SynapseSpec::new(SynapseKind::Exc, 0.5));

    let standard = build_network(&conns, &neurons).unwrap();
    let split = build_network_split(&conns, &neurons).unwrap();
    assert!(standard.equivalent(&split));

    let balance = &standard.current_balances()[0];
    let sources: Vec<_> = balance.terms.iter().map(|t| t.source).collect();
    assert_eq!(
        sources,
        vec![ContributionSource::Intrinsic, ContributionSource::Synapse(0)]
    );
    assert_eq!(standard.arena().name(balance.terms[0].var), "L.i_intrinsic");
    assert_eq!(extract_voltages(&standard).unwrap().len(), 1);
}

#[test]
fn differential_current_port_is_rejected() {
    let integrating = make_component(
        "D",
        vec![
            StateVar::new("v", Domain::Voltage, -65.0),
            StateVar::new("i", Domain::Current, 0.0),
        ],
        &[],
        vec![
            Equation::parse("dv/dt = -i").unwrap(),
            Equation::parse("di/dt = -i").unwrap(),
        ],
        &[(PortRole::V, "v"), (PortRole::I, "i")],
    )
    .unwrap();
    let err = resolve_network(&Connections::new(), &[integrating]).unwrap_err();
    assert!(matches!(err, NwireError::MalformedComponent { ref component, .. } if component == "D"));
    assert_eq!(err.kind(), ErrorKind::Definition);
}

#[test]
fn one_clamp_drives_a_neuron() {
    let neurons = vec![
        models::voltage_clamp("VC", -20.0).unwrap(),
        models::hodgkin_huxley("HH").unwrap(),
    ];
    let mut conns = Connections::new();
    conns.connect("VC", "HH", SynapseSpec::new(SynapseKind::Glut, 2.0));
    let system = build_network(&conns, &neurons).unwrap();

    let voltages = extract_voltages(&system).unwrap();
    assert_eq!(voltages[0].name, "VC.v");
    assert!(voltages[0].state_index.is_none());
    assert_eq!(voltages[1].name, "HH.soma.v");
    assert!(voltages[1].state_index.is_some());
}

#[test]
fn undefined_variable_is_underdetermined() {
    let dangling = nwire_components::make_component(
        "D",
        vec![
            nwire_components::StateVar::new("v", nwire_core::Domain::Voltage, -65.0),
            nwire_components::StateVar::new("x", nwire_core::Domain::Dimensionless, 0.0),
        ],
        &[],
        vec![nwire_core::Equation::parse("dv/dt = -x").unwrap()],
        &[(PortRole::V, "v")],
    )
    .unwrap();
    for result in [
        build_network(&Connections::new(), std::slice::from_ref(&dangling)),
        build_network_split(&Connections::new(), std::slice::from_ref(&dangling)),
    ] {
        assert_eq!(
            result.unwrap_err(),
            NwireError::UnderdeterminedSystem {
                unknowns: 2,
                equations: 1,
                undefined: vec!["D.x".into()],
            }
        );
    }
}

#[test]
fn voltages_are_canonical_for_every_coupled_port() {
    let neurons = vec![
        models::hodgkin_huxley("AB").unwrap(),
        models::bursting("PD").unwrap(),
        models::hodgkin_huxley("LP").unwrap(),
    ];
    let mut conns = Connections::new();
    conns
        .connect("AB", "LP", SynapseSpec::new(SynapseKind::Chol, 30.0))
        .connect("PD", "LP", SynapseSpec::new(SynapseKind::Glut, 10.0))
        .connect("LP", "PD", SynapseSpec::new(SynapseKind::Inh, 5.0))
        .connect("AB", "PD", SynapseSpec::new(SynapseKind::Electrical, 1.0));

    let graph = resolve_network(&conns, &neurons).unwrap();
    let couplings = graph.couplings().to_vec();
    let voltage_of: Vec<(String, nwire_core::VarId)> = graph
        .neurons()
        .iter()
        .map(|n| (n.name.clone(), n.voltage))
        .collect();
    let system = reduce(graph).unwrap();

    let voltages = extract_voltages(&system).unwrap();
    assert_eq!(voltages.len(), 3);
    for ((name, v), extracted) in voltage_of.iter().zip(&voltages) {
        assert_eq!(&extracted.neuron, name);
        assert_eq!(system.canonical(*v), extracted.var);
        for (port, neuron_v) in &couplings {
            if neuron_v == v {
                assert_eq!(system.canonical(*port), extracted.var);
            }
        }
    }
    assert_eq!(
        parse_sol_for_membrane_voltages(&system).unwrap(),
        voltages.iter().map(|v| v.var).collect::<Vec<_>>()
    );
}

#[test]
fn resolution_is_deterministic() {
    let build = || {
        let neurons = vec![
            models::hodgkin_huxley("A").unwrap(),
            models::bursting("B").unwrap(),
            models::hodgkin_huxley("C").unwrap(),
        ];
        let mut conns = Connections::new();
        conns
            .connect("C", "A", SynapseSpec::new(SynapseKind::Inh, 1.0))
            .connect("A", "B", SynapseSpec::new(SynapseKind::Exc, 2.0))
            .connect("B", "C", SynapseSpec::new(SynapseKind::Electrical, 0.5))
            .connect("C", "A", SynapseSpec::new(SynapseKind::Glut, 3.0));
        resolve_network(&conns, &neurons).unwrap()
    };
    assert_eq!(build().render_equations(), build().render_equations());
    let first = reduce(build()).unwrap();
    let second = reduce(build()).unwrap();
    assert_eq!(first.render_equations(), second.render_equations());
}

#[test]
fn bursting_neuron_closes_calcium_balance() {
    let neurons = vec![models::bursting("PD").unwrap()];
    let graph = resolve_network(&Connections::new(), &neurons).unwrap();
    let calcium = graph.balance("PD", PortRole::Ca).unwrap();
    assert_eq!(calcium.terms.len(), 1);
    let system = reduce(graph).unwrap();
    assert!(system.is_state(system.canonical_of("PD.soma.ca").unwrap()));
    assert!(system
        .observed_definition(system.canonical_of("PD.soma.i_ca").unwrap())
        .is_some());
}
