//! Graph editing helpers shared by the passes.

use std::collections::{HashMap, HashSet};

use lumen_ir::{Layer, Model, Op};

/// Builds a map from value name to the indices of the layers consuming it.
pub(crate) fn build_consumer_map(model: &Model) -> HashMap<String, Vec<usize>> {
    let mut map: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, layer) in model.layers.iter().enumerate() {
        for (_, input) in layer.present_inputs() {
            let consumers = map.entry(input.to_string()).or_default();
            if consumers.last() != Some(&i) {
                consumers.push(i);
            }
        }
    }
    map
}

/// `true` if exactly one layer consumes `name`, through a single slot, and
/// the value is not a model output.
pub(crate) fn has_single_use(
    model: &Model,
    name: &str,
    consumers: &HashMap<String, Vec<usize>>,
) -> bool {
    if model.is_output(name) {
        return false;
    }
    match consumers.get(name).map(Vec::as_slice) {
        Some([only]) => model.layers[*only]
            .inputs
            .iter()
            .filter(|i| i.as_str() == name)
            .count()
            == 1,
        _ => false,
    }
}

/// Deletes the layers named in `removed` and rewrites every remaining
/// reference through `remap` with a single lookup.
///
/// `remap` maps deleted value names to surviving ones; chains such as
/// `c -> b -> a` are followed to the final name first. Deleted names that
/// are model outputs get an `Identity` layer under the original name
/// pointing at the survivor.
pub(crate) fn remove_and_remap(
    model: &mut Model,
    removed: &HashSet<String>,
    remap: &HashMap<String, String>,
) {
    let mut remap = remap.clone();
    resolve_chains(&mut remap);
    let removed_outputs: HashSet<String> = model
        .layers
        .iter()
        .filter(|l| removed.contains(&l.name))
        .flat_map(|l| l.output_names().map(str::to_string).collect::<Vec<_>>())
        .chain(remap.keys().cloned())
        .collect();
    debug_assert!(
        remap.values().all(|target| !removed_outputs.contains(target)),
        "remap target points at a removed name"
    );

    model.layers.retain(|l| !removed.contains(&l.name));
    model.cpu_fallback.retain(|name| !removed.contains(name));

    for layer in &mut model.layers {
        for input in &mut layer.inputs {
            if let Some(target) = remap.get(input.as_str()) {
                input.clone_from(target);
            }
        }
    }

    let mut spliced = HashSet::new();
    for output in model.outputs.clone() {
        if !removed_outputs.contains(&output) || !spliced.insert(output.clone()) {
            continue;
        }
        if let Some(target) = remap.get(&output) {
            log::debug!("splicing identity '{output}' -> '{target}'");
            model
                .layers
                .push(Layer::new(output.as_str(), Op::Identity, &[target.as_str()]));
        }
    }
}

/// Replaces the consumer at `consumer_idx` by a fused layer computing `op`
/// over `inputs`, then deletes the producer at `producer_idx`.
///
/// The fused layer keeps the consumer's name, outputs and position, so no
/// reference needs rewriting. The producer's outputs must have no other
/// consumer.
pub(crate) fn fuse_into_consumer(
    model: &mut Model,
    producer_idx: usize,
    consumer_idx: usize,
    op: Op,
    inputs: Vec<String>,
) {
    debug_assert!(producer_idx < consumer_idx);
    log::debug!(
        "fusing '{}' into '{}' as {}",
        model.layers[producer_idx].name,
        model.layers[consumer_idx].name,
        op.op_type()
    );
    let consumer = &mut model.layers[consumer_idx];
    consumer.op = op;
    consumer.inputs = inputs;
    let producer = model.layers.remove(producer_idx);
    model.cpu_fallback.remove(&producer.name);
}

/// Resolves chains so every key maps to a name that is not itself a key.
pub(crate) fn resolve_chains(remap: &mut HashMap<String, String>) {
    let keys: Vec<String> = remap.keys().cloned().collect();
    for key in keys {
        let mut target = remap[&key].clone();
        let mut hops = 0;
        while let Some(next) = remap.get(&target) {
            if next == &key || hops > remap.len() {
                break;
            }
            target = next.clone();
            hops += 1;
        }
        remap.insert(key, target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_ir::{DataType, SymbolicTensorShape};

    fn model() -> Model {
        let mut model = Model::new();
        model
            .add_input("x", DataType::Float, SymbolicTensorShape::unknown_rank())
            .unwrap();
        model.add_layer(Layer::new("a", Op::Relu, &["x"])).unwrap();
        model.add_layer(Layer::new("b", Op::Relu, &["x"])).unwrap();
        model.add_layer(Layer::new("c", Op::Add, &["a", "b"])).unwrap();
        model.add_output("b");
        model.add_output("c");
        model
    }

    #[test]
    fn remaps_consumers_and_splices_outputs() {
        let mut model = model();
        let removed = HashSet::from(["b".to_string()]);
        let remap = HashMap::from([("b".to_string(), "a".to_string())]);
        remove_and_remap(&mut model, &removed, &remap);

        assert_eq!(model.layer("c").unwrap().inputs, vec!["a", "a"]);
        let splice = model.layer("b").unwrap();
        assert_eq!(splice.op, Op::Identity);
        assert_eq!(splice.inputs, vec!["a"]);
    }

    #[test]
    fn single_use_excludes_outputs_and_double_slots() {
        let model = model();
        let consumers = build_consumer_map(&model);
        assert!(has_single_use(&model, "a", &consumers));
        assert!(!has_single_use(&model, "b", &consumers));
        assert!(!has_single_use(&model, "x", &consumers));
    }

    #[test]
    fn chained_removals_point_at_the_survivor() {
        let mut model = Model::new();
        model
            .add_input("x", DataType::Float, SymbolicTensorShape::unknown_rank())
            .unwrap();
        model.add_layer(Layer::new("a", Op::Relu, &["x"])).unwrap();
        model.add_layer(Layer::new("b", Op::Identity, &["a"])).unwrap();
        model.add_layer(Layer::new("c", Op::Identity, &["b"])).unwrap();
        model.add_layer(Layer::new("d", Op::Exp, &["c"])).unwrap();
        model.add_output("c");
        model.add_output("d");

        let removed = HashSet::from(["b".to_string(), "c".to_string()]);
        let remap = HashMap::from([
            ("c".to_string(), "b".to_string()),
            ("b".to_string(), "a".to_string()),
        ]);
        remove_and_remap(&mut model, &removed, &remap);

        assert_eq!(model.layer("d").unwrap().inputs, vec!["a"]);
        assert_eq!(model.layer("c").unwrap().inputs, vec!["a"]);
        assert!(model.layer("b").is_none());
    }

    #[test]
    fn chains_resolve_to_final_names() {
        let mut remap = HashMap::from([
            ("c".to_string(), "b".to_string()),
            ("b".to_string(), "a".to_string()),
        ]);
        resolve_chains(&mut remap);
        assert_eq!(remap["c"], "a");
        assert_eq!(remap["b"], "a");
    }
}
